//! Profile management.
//!
//! A profile is a named, independently configured container instance with its
//! own rootfs. The store guarantees a handful of invariants at all times:
//!
//! - at least one profile exists (the `default` profile is seeded on first use)
//! - exactly one profile is active, and its id resolves
//! - deleting the active profile promotes the first remaining one
//!
//! Profiles persist as a JSON array through the [`KvStore`], written back on
//! every mutation. A corrupt blob is treated as an empty store and reseeded.

use crate::constants::{
    DEFAULT_ADB_ADDRESS, DEFAULT_CONTROL_ADDRESS, DEFAULT_PROFILE_ID, INIT_BINARY,
    SANITIZED_ID_MAX_LEN,
};
use crate::kv::{self, KvStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Rendering/launch mode of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileMode {
    /// In-process OpenGL renderer through the loader library.
    #[default]
    Legacy,
    /// Standalone server rendering over the network.
    Server,
}

/// A named container configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Stable opaque identifier.
    pub id: String,
    /// Human name, unique case-insensitively within the store.
    pub name: String,
    /// Explicit rootfs location; empty means derived from the id.
    #[serde(default)]
    pub rootfs_path: String,
    /// Control endpoint, `host:port`.
    #[serde(default = "default_control_address")]
    pub control_port: String,
    /// ADB endpoint, `host:port`.
    #[serde(default = "default_adb_address")]
    pub adb_port: String,
    #[serde(default)]
    pub mode: ProfileMode,
    #[serde(default)]
    pub verbose_debug: bool,
    #[serde(rename = "use3rdPartyRom", default)]
    pub use_third_party_rom: bool,
    /// Milliseconds since epoch.
    #[serde(default = "now_millis")]
    pub created_at: u64,
    /// Milliseconds since epoch.
    #[serde(default = "now_millis")]
    pub last_used_at: u64,
}

fn default_control_address() -> String {
    DEFAULT_CONTROL_ADDRESS.to_string()
}

fn default_adb_address() -> String {
    DEFAULT_ADB_ADDRESS.to_string()
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Profile {
    /// Creates a profile with default settings and a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            rootfs_path: String::new(),
            control_port: default_control_address(),
            adb_port: default_adb_address(),
            mode: ProfileMode::Legacy,
            verbose_debug: false,
            use_third_party_rom: false,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Stamps the profile as used now.
    pub fn touch(&mut self) {
        self.last_used_at = now_millis();
    }

    /// The port component of the control endpoint, if well formed.
    pub fn control_port_number(&self) -> Option<u16> {
        port_of(&self.control_port)
    }

    /// The port component of the ADB endpoint, if well formed.
    pub fn adb_port_number(&self) -> Option<u16> {
        port_of(&self.adb_port)
    }
}

/// Extracts and validates the port of a `host:port` string. Port 0 is not a
/// bindable endpoint for the guest, so it is rejected.
fn port_of(address: &str) -> Option<u16> {
    let (_, port) = address.rsplit_once(':')?;
    match port.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(p) => Some(p),
    }
}

// =============================================================================
// Store
// =============================================================================

/// Ordered collection of profiles plus the active id, persisted through the
/// key-value store.
pub struct ProfileStore {
    kv: Arc<KvStore>,
    data_dir: PathBuf,
    profiles: Vec<Profile>,
    active_id: String,
}

impl ProfileStore {
    /// Loads the persisted profiles, seeding a `default` profile when the
    /// blob is missing or corrupt and repairing a dangling active id.
    pub fn load(kv: Arc<KvStore>, data_dir: &Path) -> Self {
        let blob = kv.get_string(kv::PROFILES_DATA, "");
        let active_id = kv.get_string(kv::ACTIVE_PROFILE_ID, DEFAULT_PROFILE_ID);

        let profiles: Vec<Profile> = if blob.is_empty() {
            Vec::new()
        } else {
            match serde_json::from_str(&blob) {
                Ok(profiles) => profiles,
                Err(e) => {
                    warn!(error = %e, "corrupt profile data, resetting store");
                    Vec::new()
                }
            }
        };

        let mut store = Self {
            kv,
            data_dir: data_dir.to_path_buf(),
            profiles,
            active_id,
        };

        if store.profiles.is_empty() {
            let mut seeded = Profile::new("Default");
            seeded.id = DEFAULT_PROFILE_ID.to_string();
            info!(id = %seeded.id, "seeding default profile");
            store.profiles.push(seeded);
            store.active_id = DEFAULT_PROFILE_ID.to_string();
            store.persist();
        } else if store.by_id(&store.active_id.clone()).is_none() {
            store.active_id = store.profiles[0].id.clone();
            store.persist_active_id();
        }

        store
    }

    /// Snapshot of all profiles in insertion order.
    pub fn all(&self) -> Vec<Profile> {
        self.profiles.clone()
    }

    /// Snapshot ordered by last use, most recent first.
    pub fn sorted_by_last_used(&self) -> Vec<Profile> {
        let mut sorted = self.profiles.clone();
        sorted.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        sorted
    }

    pub fn count(&self) -> usize {
        self.profiles.len()
    }

    pub fn by_id(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// The active profile. The store never lets the active id dangle, so this
    /// always resolves.
    pub fn active(&self) -> &Profile {
        self.by_id(&self.active_id)
            .unwrap_or_else(|| &self.profiles[0])
    }

    pub fn active_id(&self) -> &str {
        &self.active_id
    }

    /// Makes `id` active; unknown ids are ignored.
    pub fn set_active(&mut self, id: &str) {
        if self.by_id(id).is_some() {
            self.active_id = id.to_string();
            self.persist_active_id();
        }
    }

    /// Appends a profile. Callers ensure id and name uniqueness beforehand.
    pub fn add(&mut self, profile: Profile) {
        self.profiles.push(profile);
        self.persist();
    }

    /// Replaces the profile with the same id; absent ids are ignored.
    pub fn update(&mut self, profile: Profile) {
        if let Some(slot) = self.profiles.iter_mut().find(|p| p.id == profile.id) {
            *slot = profile;
            self.persist();
        }
    }

    /// Removes a profile. Refuses to empty the store; deleting the active
    /// profile promotes the first remaining one.
    pub fn delete(&mut self, id: &str) -> bool {
        if self.profiles.len() <= 1 {
            return false;
        }
        let Some(index) = self.profiles.iter().position(|p| p.id == id) else {
            return false;
        };
        self.profiles.remove(index);
        if self.active_id == id {
            self.active_id = self.profiles[0].id.clone();
            self.persist_active_id();
        }
        self.persist();
        true
    }

    /// Deep-copies a profile under a fresh id and ` (Copy)` name.
    pub fn duplicate(&mut self, id: &str) -> Option<Profile> {
        let original = self.by_id(id)?.clone();
        let now = now_millis();
        let mut copy = original;
        copy.id = uuid::Uuid::new_v4().to_string();
        copy.name.push_str(" (Copy)");
        copy.created_at = now;
        copy.last_used_at = now;
        self.add(copy.clone());
        Some(copy)
    }

    /// Case-insensitive name uniqueness check, ignoring `exclude_id`.
    pub fn is_name_unique(&self, name: &str, exclude_id: Option<&str>) -> bool {
        !self.profiles.iter().any(|p| {
            p.name.eq_ignore_ascii_case(name) && Some(p.id.as_str()) != exclude_id
        })
    }

    /// Appends ` 1`, ` 2`, ... to `base` until the name is unique.
    pub fn generate_unique_name(&self, base: &str) -> String {
        let mut name = base.to_string();
        let mut counter = 1;
        while !self.is_name_unique(&name, None) {
            name = format!("{base} {counter}");
            counter += 1;
        }
        name
    }

    /// Resolves the rootfs directory for a profile.
    ///
    /// An explicit absolute filesystem path wins; content URIs and relative
    /// paths fall back to the derived per-profile directory.
    pub fn rootfs_dir(&self, profile: &Profile) -> PathBuf {
        if !profile.rootfs_path.is_empty() && !profile.rootfs_path.starts_with("content://") {
            let custom = PathBuf::from(&profile.rootfs_path);
            if custom.is_absolute() {
                return custom;
            }
        }

        if profile.id == DEFAULT_PROFILE_ID {
            self.data_dir.join("rootfs")
        } else {
            self.data_dir
                .join(format!("rootfs_{}", sanitize_for_path(&profile.id)))
        }
    }

    /// True when the profile's rootfs contains an `init` binary.
    pub fn rootfs_initialized(&self, profile: &Profile) -> bool {
        self.rootfs_dir(profile).join(INIT_BINARY).is_file()
    }

    fn persist(&self) {
        match serde_json::to_string(&self.profiles) {
            Ok(json) => self.kv.set_string(kv::PROFILES_DATA, &json),
            Err(e) => warn!(error = %e, "failed to serialize profiles"),
        }
        self.persist_active_id();
    }

    fn persist_active_id(&self) {
        self.kv.set_string(kv::ACTIVE_PROFILE_ID, &self.active_id);
    }
}

/// Keeps `[A-Za-z0-9-]` and truncates, so an id is always safe inside a
/// directory name. An id with no safe characters maps to `default`.
fn sanitize_for_path(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(SANITIZED_ID_MAX_LEN)
        .collect();
    if sanitized.is_empty() {
        DEFAULT_PROFILE_ID.to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_alphanumerics_and_dashes() {
        assert_eq!(sanitize_for_path("abc-123"), "abc-123");
        assert_eq!(sanitize_for_path("a/b\\c!"), "abc");
        assert_eq!(sanitize_for_path("///"), "default");
    }

    #[test]
    fn sanitize_truncates() {
        let long = "x".repeat(64);
        assert_eq!(sanitize_for_path(&long).len(), SANITIZED_ID_MAX_LEN);
    }

    #[test]
    fn port_extraction() {
        assert_eq!(port_of("127.0.0.1:8765"), Some(8765));
        assert_eq!(port_of("0.0.0.0:1"), Some(1));
        assert_eq!(port_of("no-port"), None);
        assert_eq!(port_of("host:0"), None);
        assert_eq!(port_of("host:99999"), None);
    }

    #[test]
    fn profile_json_round_trip() {
        let profile = Profile::new("Work");
        let json = serde_json::to_string(&profile).unwrap();
        let back: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(profile, back);
    }

    #[test]
    fn profile_json_uses_original_field_names() {
        let profile = Profile::new("Work");
        let json = serde_json::to_string(&profile).unwrap();
        assert!(json.contains("\"rootfsPath\""));
        assert!(json.contains("\"controlPort\""));
        assert!(json.contains("\"use3rdPartyRom\""));
        assert!(json.contains("\"lastUsedAt\""));
    }
}
