//! ROM metadata probing.
//!
//! Every ROM carries a `rom.ini` properties file at its root describing the
//! build: author, version, free-form description, payload md5 and a
//! monotonically increasing build code. The code drives upgrade decisions; a
//! bundled ROM with a higher code than the installed one triggers a
//! re-extract on the next boot.
//!
//! Any read or parse failure yields [`RomInfo::unknown`], which compares
//! unequal to every real info and reports `is_valid() == false`.

use crate::constants::{ROM_INFO_DEFAULT, ROM_INFO_FILE};
use crate::extract::open_archive;
use std::fs;
use std::io::Read;
use std::path::Path;
use tar::Archive;
use tracing::{debug, warn};

/// Metadata parsed from a ROM's `rom.ini`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomInfo {
    pub author: String,
    pub version: String,
    pub desc: String,
    pub md5: String,
    /// Monotonically increasing build code.
    pub code: u64,
}

impl RomInfo {
    /// The sentinel for "no valid info".
    pub fn unknown() -> Self {
        Self {
            author: ROM_INFO_DEFAULT.to_string(),
            version: ROM_INFO_DEFAULT.to_string(),
            desc: ROM_INFO_DEFAULT.to_string(),
            md5: String::new(),
            code: 0,
        }
    }

    /// False for the sentinel, true for anything actually parsed.
    pub fn is_valid(&self) -> bool {
        *self != Self::unknown()
    }

    /// Scans archive entries for `rom.ini` and parses it.
    ///
    /// Returns [`RomInfo::unknown`] if the archive is unreadable or carries
    /// no metadata file.
    pub fn from_archive(path: &Path) -> Self {
        let reader = match open_archive(path) {
            Ok(r) => r,
            Err(e) => {
                warn!(archive = %path.display(), error = %e, "cannot open archive for rom info");
                return Self::unknown();
            }
        };

        let mut tar = Archive::new(reader);
        let entries = match tar.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(archive = %path.display(), error = %e, "cannot iterate archive");
                return Self::unknown();
            }
        };

        for entry in entries {
            let mut entry = match entry {
                Ok(e) => e,
                Err(_) => return Self::unknown(),
            };
            let name = match entry.path() {
                Ok(p) => p.to_string_lossy().to_string(),
                Err(_) => continue,
            };
            if name == ROM_INFO_FILE || name == format!("./{ROM_INFO_FILE}") {
                let mut contents = String::new();
                if entry.read_to_string(&mut contents).is_err() {
                    return Self::unknown();
                }
                return Self::parse(&contents);
            }
        }

        debug!(archive = %path.display(), "archive has no rom.ini");
        Self::unknown()
    }

    /// Reads `<dir>/rom.ini` directly.
    pub fn from_dir(dir: &Path) -> Self {
        match fs::read_to_string(dir.join(ROM_INFO_FILE)) {
            Ok(contents) => Self::parse(&contents),
            Err(_) => Self::unknown(),
        }
    }

    /// Parses `key=value` lines; `#` and `;` lines are comments.
    fn parse(contents: &str) -> Self {
        let mut info = Self::unknown();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "author" => info.author = value.to_string(),
                "version" => info.version = value.to_string(),
                "desc" => info.desc = value.to_string(),
                "md5" => info.md5 = value.to_string(),
                "code" => info.code = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        info
    }
}

/// True when the bundled ROM should replace the current one.
pub fn needs_upgrade(current: &RomInfo, bundled: &RomInfo) -> bool {
    !current.is_valid() || bundled.code > current.code
}
