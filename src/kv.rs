//! Durable process-local key-value store.
//!
//! A single JSON object file holds every typed scalar the daemon persists:
//! profile data, ROM install flags and endpoint overrides. Writes commit to
//! disk before returning, via a temp-file + rename so a crash never leaves a
//! torn file behind. The store is deliberately infallible from the caller's
//! point of view: reads of unknown keys return the supplied fallback, and
//! write failures are logged and swallowed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// File name of the backing store inside the data directory.
const KV_FILE: &str = "app_kv.json";

// =============================================================================
// Well-Known Keys
// =============================================================================

/// Serialized profile array.
pub const PROFILES_DATA: &str = "profiles_data";

/// Id of the active profile.
pub const ACTIVE_PROFILE_ID: &str = "active_profile_id";

/// Set when the next boot must re-install the ROM (factory reset or swap).
pub const FORCE_ROM_REINSTALL: &str = "rom_should_be_re_install";

/// Set when the sideloaded third-party ROM should be installed.
pub const USE_THIRD_PARTY_ROM: &str = "should_use_third_party_rom";

/// Control endpoint override.
pub const SERVER_ADDRESS: &str = "server_address";

/// ADB endpoint override.
pub const ADB_ADDRESS: &str = "adb_address";

/// Verbose guest logging toggle.
pub const VERBOSE_DEBUG: &str = "verbose_debug";

// =============================================================================
// Store
// =============================================================================

/// A typed scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// Synchronously durable mapping of string keys to typed scalars.
pub struct KvStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, Value>>,
}

impl KvStore {
    /// Opens the store backed by `<data_dir>/app_kv.json`.
    ///
    /// A missing or corrupt file reads as an empty store.
    pub fn open(data_dir: &Path) -> Self {
        let path = data_dir.join(KV_FILE);
        let map = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt kv store, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_bool(&self, key: &str, fallback: bool) -> bool {
        match self.map.lock().unwrap().get(key) {
            Some(Value::Bool(v)) => *v,
            _ => fallback,
        }
    }

    pub fn get_int(&self, key: &str, fallback: i64) -> i64 {
        match self.map.lock().unwrap().get(key) {
            Some(Value::Int(v)) => *v,
            _ => fallback,
        }
    }

    pub fn get_string(&self, key: &str, fallback: &str) -> String {
        match self.map.lock().unwrap().get(key) {
            Some(Value::Str(v)) => v.clone(),
            _ => fallback.to_string(),
        }
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.set(key, Value::Bool(value));
    }

    pub fn set_int(&self, key: &str, value: i64) {
        self.set(key, Value::Int(value));
    }

    pub fn set_string(&self, key: &str, value: &str) {
        self.set(key, Value::Str(value.to_string()));
    }

    fn set(&self, key: &str, value: Value) {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_string(), value);
        if let Err(e) = self.persist(&map) {
            warn!(key, error = %e, "kv write failed, value kept in memory only");
        }
    }

    /// Serializes the whole map and commits it atomically.
    fn persist(&self, map: &BTreeMap<String, Value>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), entries = map.len(), "kv store committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_keys_return_fallback() {
        let temp = TempDir::new().unwrap();
        let kv = KvStore::open(temp.path());

        assert!(kv.get_bool("nope", true));
        assert_eq!(kv.get_int("nope", 7), 7);
        assert_eq!(kv.get_string("nope", "x"), "x");
    }

    #[test]
    fn writes_survive_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let kv = KvStore::open(temp.path());
            kv.set_bool(FORCE_ROM_REINSTALL, true);
            kv.set_int("density", 320);
            kv.set_string(SERVER_ADDRESS, "127.0.0.1:8765");
        }
        let kv = KvStore::open(temp.path());
        assert!(kv.get_bool(FORCE_ROM_REINSTALL, false));
        assert_eq!(kv.get_int("density", 0), 320);
        assert_eq!(kv.get_string(SERVER_ADDRESS, ""), "127.0.0.1:8765");
    }

    #[test]
    fn wrong_type_reads_as_fallback() {
        let temp = TempDir::new().unwrap();
        let kv = KvStore::open(temp.path());
        kv.set_string("key", "text");
        assert_eq!(kv.get_int("key", 42), 42);
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(KV_FILE), b"{not json").unwrap();
        let kv = KvStore::open(temp.path());
        assert_eq!(kv.get_string(PROFILES_DATA, ""), "");
    }
}
