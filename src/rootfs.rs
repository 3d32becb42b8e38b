//! Rootfs materialization and boot preparation.
//!
//! Two concerns live here, both operating on the filesystem tree a profile
//! boots from:
//!
//! - **Install** decides, per boot, whether the rootfs must be (re)extracted
//!   from the bundled or a sideloaded third-party archive, and always wipes
//!   the `system` and `vendor` partitions first so no file of a previous ROM
//!   survives a re-install.
//! - **Boot preparation** guarantees the device-node directories, the loader
//!   symlink and the socket directory exist, rotates the previous kernel log
//!   capture, and reaps orphans left behind by a prior guest.

use crate::constants::{
    BOOT_DIRS, INIT_BINARY, KMSG_FILE, LAST_KMSG_FILE, LOADER_SYMLINK, VENDOR_PROP_FILE,
    WIPED_PARTITIONS,
};
use crate::error::{Error, Result};
use crate::extract::extract_archive;
use crate::kv::{self, KvStore};
use std::fs;
use std::io::Write;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// True when the rootfs holds a guest `init` binary.
pub fn rom_exists(rootfs: &Path) -> bool {
    rootfs.join(INIT_BINARY).is_file()
}

// =============================================================================
// Install
// =============================================================================

/// Inputs to an install decision, gathered before each boot.
#[derive(Debug, Clone, Copy)]
pub struct InstallFlags {
    /// An init binary already exists in the rootfs.
    pub current_exists: bool,
    /// The bundled ROM carries a higher build code than the installed one.
    pub needs_upgrade: bool,
    /// A factory reset or ROM swap was requested.
    pub force_install: bool,
    /// The sideloaded third-party archive should be used.
    pub use_third_party: bool,
}

/// What an install pass ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallAction {
    /// First-time extraction of the bundled ROM.
    Factory,
    /// Forced re-extraction of the bundled ROM.
    ForcedFactory,
    /// Forced extraction of the third-party ROM.
    ThirdParty,
    /// The bundled ROM carried a newer build code.
    Upgrade,
    /// Nothing to do.
    None,
}

/// Materializes rootfs trees from staged ROM archives.
pub struct Installer {
    kv: Arc<KvStore>,
    bundled: PathBuf,
    third_party: PathBuf,
}

impl Installer {
    pub fn new(kv: Arc<KvStore>, files_dir: &Path) -> Self {
        Self {
            kv,
            bundled: files_dir.join(crate::constants::BUNDLED_ROM_NAME),
            third_party: files_dir.join(crate::constants::THIRD_PARTY_ROM_NAME),
        }
    }

    /// Path of the staged bundled ROM archive.
    pub fn bundled_archive(&self) -> &Path {
        &self.bundled
    }

    /// Runs one install pass over `rootfs`.
    ///
    /// The ROM-owned partitions are removed unconditionally; whether anything
    /// is extracted afterwards depends on the flags. A successful forced
    /// install clears the force flag so the next boot is a plain one.
    /// Extraction failures are returned for the control plane to report, but
    /// leave the flags untouched so the next boot retries.
    pub fn install(&self, rootfs: &Path, flags: InstallFlags) -> Result<InstallAction> {
        for partition in WIPED_PARTITIONS {
            remove_partition(rootfs, partition);
        }

        if !flags.current_exists {
            info!(rootfs = %rootfs.display(), "first boot, extracting bundled rom");
            extract_archive(&self.bundled, rootfs)?;
            return Ok(InstallAction::Factory);
        }

        if flags.force_install {
            let action = if flags.use_third_party {
                info!(archive = %self.third_party.display(), "installing third-party rom");
                extract_archive(&self.third_party, rootfs)?;
                InstallAction::ThirdParty
            } else {
                info!("factory reset, re-extracting bundled rom");
                extract_archive(&self.bundled, rootfs)?;
                InstallAction::ForcedFactory
            };
            self.kv.set_bool(kv::FORCE_ROM_REINSTALL, false);
            return Ok(action);
        }

        if flags.use_third_party {
            // A third-party ROM is only ever installed with the force flag;
            // reaching here means the flags are inconsistent.
            warn!("third-party rom requested without force install, ignoring");
            return Ok(InstallAction::None);
        }

        if flags.needs_upgrade {
            info!("bundled rom is newer, upgrading");
            extract_archive(&self.bundled, rootfs)?;
            return Ok(InstallAction::Upgrade);
        }

        debug!(rootfs = %rootfs.display(), "rootfs up to date");
        Ok(InstallAction::None)
    }
}

/// Removes a ROM-owned partition directory, tolerating absence.
fn remove_partition(rootfs: &Path, partition: &str) {
    let dir = rootfs.join(partition);
    match fs::remove_dir_all(&dir) {
        Ok(()) => debug!(partition, "partition wiped"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(partition, error = %e, "failed to wipe partition"),
    }
}

// =============================================================================
// Vendor Properties
// =============================================================================

/// Host-derived settings pushed into the guest before every boot.
#[derive(Debug, Clone)]
pub struct HostProps {
    pub language: String,
    pub country: String,
    pub timezone: String,
    pub lcd_density: u32,
}

impl HostProps {
    /// Reads locale and timezone from the host environment.
    pub fn detect(lcd_density: u32) -> Self {
        let (language, country) = split_locale(
            &std::env::var("LANG").unwrap_or_else(|_| "en_US.UTF-8".to_string()),
        );
        let timezone = std::env::var("TZ")
            .ok()
            .or_else(|| {
                fs::read_to_string("/etc/timezone")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "UTC".to_string());
        Self {
            language,
            country,
            timezone,
            lcd_density,
        }
    }
}

/// Splits a POSIX locale like `en_US.UTF-8` into language and country.
fn split_locale(locale: &str) -> (String, String) {
    let base = locale.split('.').next().unwrap_or(locale);
    match base.split_once('_') {
        Some((lang, country)) => (lang.to_string(), country.to_string()),
        None => (base.to_string(), String::new()),
    }
}

/// Writes `<rootfs>/vendor/default.prop` with the host locale, timezone and
/// display density. Runs after every install and before every boot.
pub fn init_rootfs(rootfs: &Path, props: &HostProps) -> Result<()> {
    let prop_path = rootfs.join(VENDOR_PROP_FILE);
    if let Some(parent) = prop_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(&prop_path)?;
    writeln!(file, "persist.sys.language={}", props.language)?;
    writeln!(file, "persist.sys.country={}", props.country)?;
    writeln!(file, "persist.sys.timezone={}", props.timezone)?;
    writeln!(file, "ro.sf.lcd_density={}", props.lcd_density)?;

    info!(
        timezone = %props.timezone,
        density = props.lcd_density,
        "vendor properties written"
    );
    Ok(())
}

// =============================================================================
// Boot Preparation
// =============================================================================

/// Prepares the rootfs and data directory for a guest boot.
///
/// Everything here is idempotent. Only a loader symlink failure is fatal,
/// because the guest cannot link against the renderer without it. Orphan
/// reaping is a separate step ([`kill_orphans`]); the boot pipeline runs it
/// right after this.
pub fn ensure_boot_files(rootfs: &Path, data_dir: &Path, loader: Option<&Path>) -> Result<()> {
    for dir in BOOT_DIRS {
        let path = rootfs.join(dir);
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                warn!(dir, error = %e, "failed to create boot directory");
            }
        }
    }

    fs::create_dir_all(data_dir.join("socket"))?;

    if let Some(loader) = loader {
        create_loader_symlink(data_dir, loader)?;
    }

    rotate_kmsg(data_dir);

    Ok(())
}

/// Recreates `<data>/loader64` pointing at the renderer loader.
fn create_loader_symlink(data_dir: &Path, loader: &Path) -> Result<()> {
    let link = data_dir.join(LOADER_SYMLINK);
    let _ = fs::remove_file(&link);
    symlink(loader, &link).map_err(|e| Error::LoaderLinkFailed {
        path: link.clone(),
        reason: e.to_string(),
    })?;
    debug!(link = %link.display(), target = %loader.display(), "loader symlink created");
    Ok(())
}

/// Moves the previous guest kernel log aside so the new boot starts clean.
fn rotate_kmsg(data_dir: &Path) {
    let kmsg = data_dir.join(KMSG_FILE);
    let last = data_dir.join(LAST_KMSG_FILE);
    if kmsg.exists() {
        if let Err(e) = fs::rename(&kmsg, &last) {
            warn!(error = %e, "failed to rotate kmsg");
        }
    }
}

/// Terminates processes re-parented to pid 1, the leftovers of a previous
/// guest. Kill failures (EPERM on processes of other users) are ignored.
pub fn kill_orphans() {
    let own_pid = std::process::id() as i32;
    let Ok(entries) = fs::read_dir("/proc") else {
        return;
    };

    let mut killed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid <= 1 || pid == own_pid {
            continue;
        }
        if parent_pid(pid) == Some(1) {
            // SAFETY: kill with a plain signal is safe for any pid value.
            let ret = unsafe { libc::kill(pid, libc::SIGKILL) };
            if ret == 0 {
                killed += 1;
            }
        }
    }

    if killed > 0 {
        info!(count = killed, "reaped orphan processes");
    }
}

/// Parses the ppid field (4th) of `/proc/<pid>/stat`.
fn parent_pid(pid: i32) -> Option<i32> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field is parenthesized and may contain spaces; skip past it.
    let rest = stat.rsplit_once(')').map(|(_, r)| r)?;
    rest.split_whitespace().nth(1)?.parse().ok()
}
