//! ROM archive extraction.
//!
//! Streams a tar archive (optionally gzip or xz compressed) into a rootfs
//! directory, preserving entry kinds: directories, regular files, symbolic
//! links and hard links. The format is inferred from the file name suffix
//! only.
//!
//! Failure handling is asymmetric on purpose: a directory or link that cannot
//! be created is logged and skipped, because guest images routinely carry
//! links the host filesystem rejects. A file payload that cannot be written
//! aborts the extraction, because a truncated system image must never boot.
//! Extraction over an existing tree is idempotent.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};
use xz2::read::XzDecoder;

/// Compression wrapping of a tar archive, by file name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Gzip,
    Xz,
    Plain,
}

impl ArchiveFormat {
    /// Infers the format from the archive file name.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::Gzip
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Self::Xz
        } else {
            Self::Plain
        }
    }
}

/// Opens an archive as a raw tar byte stream, decompressing as needed.
pub fn open_archive(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|e| Error::ArchiveUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let reader = BufReader::new(file);
    Ok(match ArchiveFormat::from_path(path) {
        ArchiveFormat::Gzip => Box::new(GzDecoder::new(reader)),
        ArchiveFormat::Xz => Box::new(XzDecoder::new(reader)),
        ArchiveFormat::Plain => Box::new(reader),
    })
}

/// Extracts `archive` into `target`, creating `target` if necessary.
pub fn extract_archive(archive: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target).map_err(|e| Error::ArchiveUnreadable {
        path: target.to_path_buf(),
        reason: format!("cannot create target directory: {e}"),
    })?;

    let reader = open_archive(archive)?;
    let mut tar = Archive::new(reader);

    let mut extracted = 0usize;
    let mut skipped = 0usize;

    let entries = tar.entries().map_err(|e| Error::ArchiveUnreadable {
        path: archive.to_path_buf(),
        reason: e.to_string(),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::ArchiveUnreadable {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        })?;

        let raw_name = entry
            .path()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = raw_name.strip_prefix("./").unwrap_or(&raw_name);
        if name.is_empty() {
            continue;
        }

        let out_path = target.join(name);
        let kind = entry.header().entry_type();

        match kind {
            EntryType::Directory => {
                if let Err(e) = fs::create_dir_all(&out_path) {
                    warn!(entry = name, error = %e, "failed to create directory, skipping");
                    skipped += 1;
                    continue;
                }
            }
            EntryType::Symlink => {
                let link = match link_target(&entry) {
                    Ok(link) => link,
                    Err(e) => {
                        warn!(entry = name, error = %e, "unreadable symlink target, skipping");
                        skipped += 1;
                        continue;
                    }
                };
                if let Err(e) = replace_with_symlink(&out_path, &link) {
                    warn!(entry = name, target = %link, error = %e, "failed to create symlink, skipping");
                    skipped += 1;
                    continue;
                }
            }
            EntryType::Link => {
                let link = match link_target(&entry) {
                    Ok(link) => link,
                    Err(e) => {
                        warn!(entry = name, error = %e, "unreadable hardlink target, skipping");
                        skipped += 1;
                        continue;
                    }
                };
                if let Err(e) = replace_with_hard_link(&out_path, &target.join(&link)) {
                    warn!(entry = name, target = %link, error = %e, "failed to create hardlink, skipping");
                    skipped += 1;
                    continue;
                }
            }
            _ => {
                write_file(&mut entry, &out_path, name)?;
            }
        }
        extracted += 1;
    }

    info!(
        archive = %archive.display(),
        target = %target.display(),
        extracted,
        skipped,
        "archive extracted"
    );
    Ok(())
}

/// Reads the link target of a symlink or hard link entry.
fn link_target(entry: &tar::Entry<'_, impl Read>) -> io::Result<String> {
    let link = entry
        .link_name()?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "link entry without target"))?;
    Ok(link.to_string_lossy().to_string())
}

/// Unlinks any existing entry at `path` and symlinks it to the literal target.
fn replace_with_symlink(path: &Path, link: &str) -> io::Result<()> {
    ensure_parent(path)?;
    remove_existing(path);
    symlink(link, path)
}

/// Unlinks any existing entry at `path` and hard-links it to `original`.
fn replace_with_hard_link(path: &Path, original: &Path) -> io::Result<()> {
    ensure_parent(path)?;
    remove_existing(path);
    fs::hard_link(original, path)
}

/// Streams a regular file entry to disk, preserving the executable bit.
fn write_file(entry: &mut tar::Entry<'_, impl Read>, path: &Path, name: &str) -> Result<()> {
    let to_archive_err = |e: io::Error| Error::Archive {
        entry: name.to_string(),
        reason: e.to_string(),
    };

    ensure_parent(path).map_err(to_archive_err)?;
    let mut out = File::create(path).map_err(to_archive_err)?;
    io::copy(entry, &mut out).map_err(to_archive_err)?;

    let mode = entry.header().mode().unwrap_or(0o644);
    if mode & 0o111 != 0 {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o755)) {
            debug!(entry = name, error = %e, "could not set executable bit");
        }
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.exists() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Removes a prior file, symlink or directory at `path`, if any.
fn remove_existing(path: &Path) {
    // symlink_metadata so a dangling symlink is still detected
    if let Ok(meta) = fs::symlink_metadata(path) {
        let _ = if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_suffix() {
        assert_eq!(
            ArchiveFormat::from_path(Path::new("rootfs.tar.gz")),
            ArchiveFormat::Gzip
        );
        assert_eq!(
            ArchiveFormat::from_path(Path::new("rootfs.TGZ")),
            ArchiveFormat::Gzip
        );
        assert_eq!(
            ArchiveFormat::from_path(Path::new("rom.tar.xz")),
            ArchiveFormat::Xz
        );
        assert_eq!(
            ArchiveFormat::from_path(Path::new("rom.txz")),
            ArchiveFormat::Xz
        );
        assert_eq!(
            ArchiveFormat::from_path(Path::new("rootfs.tar")),
            ArchiveFormat::Plain
        );
        assert_eq!(
            ArchiveFormat::from_path(Path::new("rootfs")),
            ArchiveFormat::Plain
        );
    }
}
