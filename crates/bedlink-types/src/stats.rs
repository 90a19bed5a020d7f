//! On-disk shapes for the two persisted preference files.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// `<proxyHost>:<address>` → cache-mode preference.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConnectPreference {
    #[serde(rename = "withoutCache")]
    pub without_cache: bool,
}

const FAILURE_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;
const HOURLY_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Per (bed, controller) success/failure record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStats {
    #[serde(default)]
    pub successes: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_success_at: Option<u64>,
    #[serde(default)]
    pub last_failure_at: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Epoch-millis timestamps of failures in the last rolling 24h,
    /// pruned lazily on every access.
    #[serde(default)]
    pub recent_failure_ats: Vec<u64>,
}

impl ControllerStats {
    pub fn record_success(&mut self, now_ms: u64) {
        self.successes += 1;
        self.consecutive_failures = 0;
        self.last_success_at = Some(now_ms);
    }

    pub fn record_failure(&mut self, now_ms: u64, error: impl Into<String>) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.last_failure_at = Some(now_ms);
        self.last_error = Some(error.into());
        self.recent_failure_ats.push(now_ms);
        self.prune(now_ms);
    }

    fn prune(&mut self, now_ms: u64) {
        self.recent_failure_ats
            .retain(|t| now_ms.saturating_sub(*t) <= FAILURE_WINDOW_MS);
    }

    /// Number of failures recorded in the last hour, used by the scorer's
    /// `recent_hourly_penalty`.
    pub fn failures_last_hour(&self, now_ms: u64) -> u32 {
        self.recent_failure_ats
            .iter()
            .filter(|t| now_ms.saturating_sub(**t) <= HOURLY_WINDOW_MS)
            .count() as u32
    }
}

/// Per-bed metadata: which linked controller is currently pinned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BedMeta {
    #[serde(rename = "pinnedController", skip_serializing_if = "Option::is_none")]
    pub pinned_controller: Option<String>,
}

/// One bed's worth of controller stats, as stored under its bed key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BedEntry {
    #[serde(rename = "_meta", default)]
    pub meta: BedMeta,
    #[serde(default)]
    pub controllers: HashMap<String, ControllerStats>,
}

/// The full controller-preferences file: `bedKey -> BedEntry`.
pub type BedControllerFile = HashMap<String, BedEntry>;

/// Current time as epoch milliseconds, the unit every timestamp field in
/// this crate uses.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_last_hour_prunes_old_entries() {
        let mut stats = ControllerStats::default();
        stats.record_failure(0, "timeout");
        stats.record_failure(30 * 60 * 1000, "timeout");
        // 2 hours later: both failures fall outside the 1h window but
        // within the 24h window.
        let now = 2 * HOURLY_WINDOW_MS;
        assert_eq!(stats.failures_last_hour(now), 0);
        assert_eq!(stats.recent_failure_ats.len(), 2);
    }

    #[test]
    fn failures_last_hour_counts_recent_only() {
        let mut stats = ControllerStats::default();
        stats.record_failure(0, "timeout");
        stats.record_failure(10 * 60 * 1000, "timeout");
        assert_eq!(stats.failures_last_hour(20 * 60 * 1000), 2);
    }

    #[test]
    fn record_success_resets_consecutive_failures() {
        let mut stats = ControllerStats::default();
        stats.record_failure(0, "timeout");
        stats.record_failure(1000, "timeout");
        assert_eq!(stats.consecutive_failures, 2);
        stats.record_success(2000);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 2);
    }

    #[test]
    fn recent_failure_ats_pruned_beyond_24h() {
        let mut stats = ControllerStats::default();
        stats.record_failure(0, "timeout");
        stats.record_failure(FAILURE_WINDOW_MS + 1, "timeout");
        assert_eq!(stats.recent_failure_ats, vec![FAILURE_WINDOW_MS + 1]);
    }
}
