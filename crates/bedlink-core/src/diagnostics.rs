//! Per-device diagnostics snapshot (§4.2's "observable side-effects
//! recorded" list), kept alongside every `DeviceSession` and surfaced
//! through the heartbeat / per-device health topic (§6).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use bedlink_types::{now_ms, AddressType, DeviceKey};

/// Snapshot of everything a `DeviceSession` has observed about its own
/// connect history. Cloned out to callers; the session keeps the live copy
/// behind its own lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDiagnostics {
    pub device_key: String,
    pub proxy_host: String,
    pub mac: String,
    pub address_type: AddressType,
    pub used_without_cache: bool,
    pub mtu: u16,
    pub error_code: u16,
    pub ignored_connects: u32,
    pub cooldown_until_ms: Option<u64>,
    pub force_without_cache_until_ms: Option<u64>,
    pub connect_duration_ms: Option<u64>,
    pub last_connected_at_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_disconnect_reason: Option<String>,
}

impl SessionDiagnostics {
    pub fn new(key: &DeviceKey, address_type: AddressType) -> Self {
        Self {
            device_key: key.persisted_key(),
            proxy_host: key.proxy_host.clone(),
            mac: key.mac_hex(),
            address_type,
            used_without_cache: false,
            mtu: 0,
            error_code: 0,
            ignored_connects: 0,
            cooldown_until_ms: None,
            force_without_cache_until_ms: None,
            connect_duration_ms: None,
            last_connected_at_ms: None,
            last_error: None,
            last_disconnect_reason: None,
        }
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.cooldown_until_ms
            .is_some_and(|until| now_ms() < until)
    }

    pub fn force_without_cache_active(&self) -> bool {
        self.force_without_cache_until_ms
            .is_some_and(|until| now_ms() < until)
    }

    pub fn set_cooldown(&mut self, duration: Duration) {
        self.cooldown_until_ms = Some(now_ms() + duration.as_millis() as u64);
    }

    pub fn set_force_without_cache(&mut self, duration: Duration) {
        self.force_without_cache_until_ms = Some(now_ms() + duration.as_millis() as u64);
    }

    pub fn record_connect_success(&mut self, used_without_cache: bool, mtu: u16, duration: Duration) {
        self.used_without_cache = used_without_cache;
        self.mtu = mtu;
        self.error_code = 0;
        self.connect_duration_ms = Some(duration.as_millis() as u64);
        self.last_connected_at_ms = Some(now_ms());
        self.last_error = None;
    }

    pub fn record_connect_failure(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn record_ignored_connect(&mut self) {
        self.ignored_connects += 1;
    }

    pub fn record_disconnect(&mut self, reason: impl Into<String>) {
        self.last_disconnect_reason = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_expires_after_duration() {
        let key = DeviceKey::new("10.0.0.1", 1);
        let mut diag = SessionDiagnostics::new(&key, AddressType::Public);
        assert!(!diag.is_in_cooldown());

        diag.set_cooldown(Duration::from_millis(0));
        // a zero-length cooldown should already be expired relative to "now"
        assert!(!diag.is_in_cooldown());
    }

    #[test]
    fn connect_success_clears_last_error() {
        let key = DeviceKey::new("10.0.0.1", 1);
        let mut diag = SessionDiagnostics::new(&key, AddressType::Public);
        diag.record_connect_failure("timeout");
        assert!(diag.last_error.is_some());

        diag.record_connect_success(true, 247, Duration::from_secs(1));
        assert!(diag.last_error.is_none());
        assert!(diag.used_without_cache);
        assert_eq!(diag.mtu, 247);
    }

    #[test]
    fn ignored_connects_accumulate() {
        let key = DeviceKey::new("10.0.0.1", 1);
        let mut diag = SessionDiagnostics::new(&key, AddressType::Public);
        diag.record_ignored_connect();
        diag.record_ignored_connect();
        assert_eq!(diag.ignored_connects, 2);
    }
}
