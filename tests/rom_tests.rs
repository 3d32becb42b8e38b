//! Tests for ROM metadata probing.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::Path;
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;
use twoyi_host::rom::{needs_upgrade, RomInfo};

fn build_archive_with_ini(path: &Path, entry_name: &str, ini: &str) {
    let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    let mut builder = Builder::new(encoder);

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_path(entry_name).unwrap();
    header.set_size(ini.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, ini.as_bytes()).unwrap();

    builder.into_inner().unwrap().finish().unwrap();
}

const SAMPLE_INI: &str = "author=weishu\nversion=0.6.0\ndesc=factory image\nmd5=d41d8cd9\ncode=21\n";

#[test]
fn probes_rom_ini_from_directory() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("rom.ini"), SAMPLE_INI).unwrap();

    let info = RomInfo::from_dir(temp.path());
    assert!(info.is_valid());
    assert_eq!(info.author, "weishu");
    assert_eq!(info.version, "0.6.0");
    assert_eq!(info.code, 21);
}

#[test]
fn missing_directory_ini_is_unknown() {
    let temp = TempDir::new().unwrap();
    assert!(!RomInfo::from_dir(temp.path()).is_valid());
}

#[test]
fn probes_rom_ini_from_archive() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rom.tar.gz");
    build_archive_with_ini(&archive, "rom.ini", SAMPLE_INI);

    let info = RomInfo::from_archive(&archive);
    assert!(info.is_valid());
    assert_eq!(info.code, 21);
}

#[test]
fn probes_dot_slash_prefixed_entry() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rom.tar.gz");
    build_archive_with_ini(&archive, "./rom.ini", SAMPLE_INI);

    assert!(RomInfo::from_archive(&archive).is_valid());
}

#[test]
fn archive_without_ini_is_unknown() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rom.tar.gz");
    build_archive_with_ini(&archive, "other.txt", "not metadata");

    assert!(!RomInfo::from_archive(&archive).is_valid());
}

#[test]
fn unreadable_archive_is_unknown() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rom.tar.gz");
    std::fs::write(&archive, b"this is not a gzip stream").unwrap();

    assert!(!RomInfo::from_archive(&archive).is_valid());
}

#[test]
fn upgrade_decision_matches_build_codes() {
    let current = parse_ini("code=5");
    let newer = parse_ini("code=6");

    assert!(needs_upgrade(&current, &newer));
    assert!(!needs_upgrade(&newer, &current));
    assert!(needs_upgrade(&RomInfo::unknown(), &current));
    assert!(!needs_upgrade(&current, &RomInfo::unknown()));
}

/// Parses an ini snippet through the directory probe.
fn parse_ini(ini: &str) -> RomInfo {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("rom.ini"), ini).unwrap();
    RomInfo::from_dir(temp.path())
}
