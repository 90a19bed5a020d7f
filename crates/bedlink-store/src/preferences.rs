//! `<name>-ble-preferences.json`: per-[`DeviceKey`] connect cache-mode preference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bedlink_core::ConnectPreferences;
use bedlink_types::{ConnectPreference, DeviceKey};
use tracing::debug;

use crate::atomic::{read_json_or_default, write_json_atomic};
use crate::error::Result;

/// Thread-safe, file-backed store of per-device connect preferences.
///
/// Every mutation rewrites the whole file atomically. The map is small
/// (bounded by the configured device fleet) so this is simpler and safer
/// than a partial-update scheme.
pub struct PreferenceStore {
    path: PathBuf,
    data: RwLock<HashMap<String, ConnectPreference>>,
}

impl PreferenceStore {
    /// Open (or create on first write) the preference file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = read_json_or_default(&path)?;
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// The conventional path for an add-on named `name`: `<dir>/<name>-ble-preferences.json`.
    pub fn default_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}-ble-preferences.json"))
    }

    pub fn get(&self, key: &DeviceKey) -> Option<ConnectPreference> {
        self.data.read().unwrap().get(&key.persisted_key()).copied()
    }

    pub fn without_cache(&self, key: &DeviceKey) -> bool {
        self.get(key).map(|p| p.without_cache).unwrap_or(false)
    }

    /// Persist `without_cache` for `key` if it differs from the stored
    /// value (or there was none). Returns `true` if the file was rewritten.
    pub fn set_without_cache(&self, key: &DeviceKey, without_cache: bool) -> Result<bool> {
        let changed = {
            let mut guard = self.data.write().unwrap();
            let entry = guard.entry(key.persisted_key()).or_default();
            if entry.without_cache == without_cache {
                false
            } else {
                entry.without_cache = without_cache;
                true
            }
        };

        if changed {
            debug!(key = %key.persisted_key(), without_cache, "persisting connect preference");
            let snapshot = self.data.read().unwrap().clone();
            write_json_atomic(&self.path, &snapshot)?;
        }
        Ok(changed)
    }
}

/// Lets `bedlink-core`'s `DeviceSession` read and persist the cache-mode
/// preference without this crate's concrete type leaking into core.
impl ConnectPreferences for PreferenceStore {
    fn without_cache(&self, key: &DeviceKey) -> bool {
        PreferenceStore::without_cache(self, key)
    }

    fn set_without_cache(&self, key: &DeviceKey, value: bool) -> bedlink_core::Result<bool> {
        PreferenceStore::set_without_cache(self, key, value)
            .map_err(|e| bedlink_core::Error::persistence(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_matches_convention() {
        let path = PreferenceStore::default_path(Path::new("/data"), "smartbedmqtt");
        assert_eq!(path, PathBuf::from("/data/smartbedmqtt-ble-preferences.json"));
    }

    #[test]
    fn unset_key_defaults_to_with_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::open(dir.path().join("prefs.json")).unwrap();
        let key = DeviceKey::new("10.0.0.1", 0x1122_3344_5566);
        assert!(!store.without_cache(&key));
    }

    #[test]
    fn set_without_cache_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        let key = DeviceKey::new("10.0.0.1", 0x1122_3344_5566);

        {
            let store = PreferenceStore::open(&path).unwrap();
            assert!(store.set_without_cache(&key, true).unwrap());
            // Setting the same value again is a no-op.
            assert!(!store.set_without_cache(&key, true).unwrap());
        }

        let reopened = PreferenceStore::open(&path).unwrap();
        assert!(reopened.without_cache(&key));
    }

    #[test]
    fn different_device_keys_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::open(dir.path().join("prefs.json")).unwrap();
        let a = DeviceKey::new("10.0.0.1", 1);
        let b = DeviceKey::new("10.0.0.1", 2);
        store.set_without_cache(&a, true).unwrap();
        assert!(store.without_cache(&a));
        assert!(!store.without_cache(&b));
    }
}
