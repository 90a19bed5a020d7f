//! `<name>-<vendor>-controller-preferences.json`: per-bed controller stats
//! and the pinned-controller choice.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bedlink_core::ControllerStatsPort;
use bedlink_types::{BedControllerFile, ControllerStats};
use tracing::debug;

use crate::atomic::{read_json_or_default, write_json_atomic};
use crate::error::Result;

/// Thread-safe, file-backed store of controller success/failure stats and
/// sticky-selection state, keyed by `(bed_key, controller_key)`.
pub struct ControllerStatsStore {
    path: PathBuf,
    data: RwLock<BedControllerFile>,
}

impl ControllerStatsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = read_json_or_default(&path)?;
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// The conventional path for an add-on named `name` serving vendor
    /// `vendor`: `<dir>/<name>-<vendor>-controller-preferences.json`.
    pub fn default_path(dir: &Path, name: &str, vendor: &str) -> PathBuf {
        dir.join(format!("{name}-{vendor}-controller-preferences.json"))
    }

    pub fn stats(&self, bed_key: &str, controller_key: &str) -> ControllerStats {
        self.data
            .read()
            .unwrap()
            .get(bed_key)
            .and_then(|entry| entry.controllers.get(controller_key))
            .cloned()
            .unwrap_or_default()
    }

    pub fn pinned_controller(&self, bed_key: &str) -> Option<String> {
        self.data
            .read()
            .unwrap()
            .get(bed_key)
            .and_then(|entry| entry.meta.pinned_controller.clone())
    }

    pub fn set_pinned_controller(&self, bed_key: &str, controller_key: &str) -> Result<()> {
        {
            let mut guard = self.data.write().unwrap();
            let entry = guard.entry(bed_key.to_string()).or_default();
            if entry.meta.pinned_controller.as_deref() == Some(controller_key) {
                return Ok(());
            }
            entry.meta.pinned_controller = Some(controller_key.to_string());
        }
        debug!(bed_key, controller_key, "pinning controller");
        self.persist()
    }

    pub fn record_success(&self, bed_key: &str, controller_key: &str, now_ms: u64) -> Result<()> {
        {
            let mut guard = self.data.write().unwrap();
            let entry = guard.entry(bed_key.to_string()).or_default();
            let stats = entry.controllers.entry(controller_key.to_string()).or_default();
            stats.record_success(now_ms);
        }
        self.persist()
    }

    pub fn record_failure(
        &self,
        bed_key: &str,
        controller_key: &str,
        now_ms: u64,
        error: impl Into<String>,
    ) -> Result<()> {
        {
            let mut guard = self.data.write().unwrap();
            let entry = guard.entry(bed_key.to_string()).or_default();
            let stats = entry.controllers.entry(controller_key.to_string()).or_default();
            stats.record_failure(now_ms, error);
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let snapshot = self.data.read().unwrap().clone();
        write_json_atomic(&self.path, &snapshot)
    }
}

/// Lets `bedlink-core`'s scorer rank candidates and pin a winner without
/// this crate's concrete type leaking into core.
impl ControllerStatsPort for ControllerStatsStore {
    fn stats(&self, bed_key: &str, controller_key: &str) -> ControllerStats {
        ControllerStatsStore::stats(self, bed_key, controller_key)
    }

    fn pinned_controller(&self, bed_key: &str) -> Option<String> {
        ControllerStatsStore::pinned_controller(self, bed_key)
    }

    fn set_pinned_controller(&self, bed_key: &str, controller_key: &str) -> bedlink_core::Result<()> {
        ControllerStatsStore::set_pinned_controller(self, bed_key, controller_key)
            .map_err(|e| bedlink_core::Error::persistence(e.to_string()))
    }

    fn record_success(&self, bed_key: &str, controller_key: &str, now_ms: u64) -> bedlink_core::Result<()> {
        ControllerStatsStore::record_success(self, bed_key, controller_key, now_ms)
            .map_err(|e| bedlink_core::Error::persistence(e.to_string()))
    }

    fn record_failure(
        &self,
        bed_key: &str,
        controller_key: &str,
        now_ms: u64,
        error: &str,
    ) -> bedlink_core::Result<()> {
        ControllerStatsStore::record_failure(self, bed_key, controller_key, now_ms, error)
            .map_err(|e| bedlink_core::Error::persistence(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_matches_convention() {
        let path = ControllerStatsStore::default_path(Path::new("/data"), "smartbedmqtt", "keeson");
        assert_eq!(
            path,
            PathBuf::from("/data/smartbedmqtt-keeson-controller-preferences.json")
        );
    }

    #[test]
    fn unknown_controller_has_zeroed_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControllerStatsStore::open(dir.path().join("stats.json")).unwrap();
        let stats = store.stats("bed1", "ctrl-a");
        assert_eq!(stats.successes, 0);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn record_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        {
            let store = ControllerStatsStore::open(&path).unwrap();
            store.record_success("bed1", "ctrl-a", 1000).unwrap();
            store.record_failure("bed1", "ctrl-b", 2000, "timeout").unwrap();
            store.set_pinned_controller("bed1", "ctrl-a").unwrap();
        }

        let reopened = ControllerStatsStore::open(&path).unwrap();
        assert_eq!(reopened.stats("bed1", "ctrl-a").successes, 1);
        assert_eq!(reopened.stats("bed1", "ctrl-b").failures, 1);
        assert_eq!(
            reopened.pinned_controller("bed1"),
            Some("ctrl-a".to_string())
        );
    }

    #[test]
    fn pinning_same_controller_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControllerStatsStore::open(dir.path().join("stats.json")).unwrap();
        store.set_pinned_controller("bed1", "ctrl-a").unwrap();
        store.set_pinned_controller("bed1", "ctrl-a").unwrap();
        assert_eq!(store.pinned_controller("bed1"), Some("ctrl-a".to_string()));
    }

    #[test]
    fn beds_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControllerStatsStore::open(dir.path().join("stats.json")).unwrap();
        store.record_success("bed1", "ctrl-a", 1000).unwrap();
        store.record_success("bed2", "ctrl-a", 1000).unwrap();
        store.record_failure("bed2", "ctrl-a", 2000, "x").unwrap();
        assert_eq!(store.stats("bed1", "ctrl-a").failures, 0);
        assert_eq!(store.stats("bed2", "ctrl-a").failures, 1);
    }
}
