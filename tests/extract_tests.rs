//! Tests for the archive extractor.
//!
//! Builds small synthetic ROM archives and validates entry-kind fidelity,
//! name normalization, executable-bit handling and idempotence.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;
use twoyi_host::extract::extract_archive;
use xz2::write::XzEncoder;

// =============================================================================
// Archive Builders
// =============================================================================

enum Entry<'a> {
    Dir(&'a str),
    File(&'a str, u32, &'a [u8]),
    Symlink(&'a str, &'a str),
    HardLink(&'a str, &'a str),
}

fn append_entries<W: Write>(builder: &mut Builder<W>, entries: &[Entry<'_>]) {
    for entry in entries {
        match entry {
            Entry::Dir(name) => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Directory);
                header.set_path(name).unwrap();
                header.set_size(0);
                header.set_mode(0o755);
                header.set_cksum();
                builder.append(&header, std::io::empty()).unwrap();
            }
            Entry::File(name, mode, data) => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Regular);
                header.set_path(name).unwrap();
                header.set_size(data.len() as u64);
                header.set_mode(*mode);
                header.set_cksum();
                builder.append(&header, *data).unwrap();
            }
            Entry::Symlink(name, target) => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Symlink);
                header.set_path(name).unwrap();
                header.set_link_name(target).unwrap();
                header.set_size(0);
                header.set_mode(0o777);
                header.set_cksum();
                builder.append(&header, std::io::empty()).unwrap();
            }
            Entry::HardLink(name, target) => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Link);
                header.set_path(name).unwrap();
                header.set_link_name(target).unwrap();
                header.set_size(0);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append(&header, std::io::empty()).unwrap();
            }
        }
    }
}

fn build_tar_gz(path: &Path, entries: &[Entry<'_>]) {
    let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    let mut builder = Builder::new(encoder);
    append_entries(&mut builder, entries);
    builder.into_inner().unwrap().finish().unwrap();
}

fn build_tar_xz(path: &Path, entries: &[Entry<'_>]) {
    let encoder = XzEncoder::new(File::create(path).unwrap(), 6);
    let mut builder = Builder::new(encoder);
    append_entries(&mut builder, entries);
    builder.into_inner().unwrap().finish().unwrap();
}

fn build_tar(path: &Path, entries: &[Entry<'_>]) {
    let mut builder = Builder::new(File::create(path).unwrap());
    append_entries(&mut builder, entries);
    builder.into_inner().unwrap();
}

// =============================================================================
// Entry Kinds
// =============================================================================

#[test]
fn extracts_dirs_files_and_symlinks() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rom.tar.gz");
    build_tar_gz(
        &archive,
        &[
            Entry::Dir("a/"),
            Entry::File("a/b", 0o755, b"hi"),
            Entry::Symlink("a/c", "b"),
        ],
    );

    let target = temp.path().join("rootfs");
    extract_archive(&archive, &target).unwrap();

    assert!(target.join("a").is_dir());

    let file = target.join("a/b");
    assert!(file.is_file());
    assert_eq!(std::fs::read(&file).unwrap(), b"hi");
    let mode = std::fs::metadata(&file).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0, "executable bit must be preserved");

    let link = target.join("a/c");
    assert_eq!(
        std::fs::read_link(&link).unwrap(),
        PathBuf::from("b"),
        "symlink target must be the literal link name"
    );
}

#[test]
fn hard_links_share_an_inode() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rom.tar.gz");
    build_tar_gz(
        &archive,
        &[
            Entry::File("f", 0o644, b"payload"),
            Entry::HardLink("g", "f"),
        ],
    );

    let target = temp.path().join("rootfs");
    extract_archive(&archive, &target).unwrap();

    let a = std::fs::metadata(target.join("f")).unwrap();
    let b = std::fs::metadata(target.join("g")).unwrap();
    assert_eq!(a.ino(), b.ino());
}

#[test]
fn non_executable_files_stay_non_executable() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rom.tar.gz");
    build_tar_gz(&archive, &[Entry::File("plain.txt", 0o644, b"data")]);

    let target = temp.path().join("rootfs");
    extract_archive(&archive, &target).unwrap();

    let mode = std::fs::metadata(target.join("plain.txt"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o111, 0);
}

// =============================================================================
// Name Handling
// =============================================================================

#[test]
fn leading_dot_slash_is_stripped() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rom.tar.gz");
    build_tar_gz(
        &archive,
        &[Entry::Dir("./d/"), Entry::File("./d/e", 0o644, b"x")],
    );

    let target = temp.path().join("rootfs");
    extract_archive(&archive, &target).unwrap();

    assert!(target.join("d").is_dir());
    assert!(target.join("d/e").is_file());
}

// =============================================================================
// Formats
// =============================================================================

#[test]
fn plain_tar_and_xz_are_accepted() {
    let temp = TempDir::new().unwrap();
    let entries = [Entry::File("init", 0o755, b"#!/bin/sh\n")];

    let plain = temp.path().join("rom.tar");
    build_tar(&plain, &entries);
    let target = temp.path().join("from_plain");
    extract_archive(&plain, &target).unwrap();
    assert!(target.join("init").is_file());

    let xz = temp.path().join("rom.tar.xz");
    build_tar_xz(&xz, &entries);
    let target = temp.path().join("from_xz");
    extract_archive(&xz, &target).unwrap();
    assert!(target.join("init").is_file());
}

#[test]
fn link_entry_without_target_is_skipped() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rom.tar.gz");

    let encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
    let mut builder = Builder::new(encoder);
    // A degenerate symlink header with no link target, as a truncated or
    // corrupted stream can produce.
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Symlink);
    header.set_path("broken").unwrap();
    header.set_size(0);
    header.set_mode(0o777);
    header.set_cksum();
    builder.append(&header, std::io::empty()).unwrap();
    append_entries(&mut builder, &[Entry::File("good", 0o644, b"kept")]);
    builder.into_inner().unwrap().finish().unwrap();

    let target = temp.path().join("rootfs");
    extract_archive(&archive, &target).unwrap();

    // The rest of the archive still lands.
    assert!(!target.join("broken").exists());
    assert_eq!(std::fs::read(target.join("good")).unwrap(), b"kept");
}

#[test]
fn missing_archive_is_an_error() {
    let temp = TempDir::new().unwrap();
    let result = extract_archive(
        &temp.path().join("nope.tar.gz"),
        &temp.path().join("rootfs"),
    );
    assert!(result.is_err());
}

// =============================================================================
// Idempotence
// =============================================================================

#[test]
fn repeated_extraction_yields_identical_tree() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rom.tar.gz");
    build_tar_gz(
        &archive,
        &[
            Entry::Dir("sys/"),
            Entry::File("sys/app", 0o755, b"binary"),
            Entry::File("sys/conf", 0o644, b"key=value"),
            Entry::Symlink("sys/link", "app"),
            Entry::HardLink("sys/hard", "sys/app"),
        ],
    );

    let target = temp.path().join("rootfs");
    extract_archive(&archive, &target).unwrap();
    let first = snapshot(&target);
    extract_archive(&archive, &target).unwrap();
    let second = snapshot(&target);

    assert_eq!(first, second);
}

/// Collects (relative path, kind, content-or-target, execute bit) per entry.
fn snapshot(root: &Path) -> Vec<(String, String, String, bool)> {
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, String, String, bool)>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        let rel = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
        let meta = std::fs::symlink_metadata(&path).unwrap();
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&path).unwrap();
            out.push((rel, "symlink".into(), target.to_string_lossy().into(), false));
        } else if meta.is_dir() {
            out.push((rel.clone(), "dir".into(), String::new(), false));
            walk(root, &path, out);
        } else {
            let content = String::from_utf8_lossy(&std::fs::read(&path).unwrap()).to_string();
            let exec = meta.permissions().mode() & 0o111 != 0;
            out.push((rel, "file".into(), content, exec));
        }
    }
}
