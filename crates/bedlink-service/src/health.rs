//! Health Monitor (§4.5): the single place failure counting, restart
//! requests, and proxy-reboot dispatch live. One instance is constructed
//! per supervisor outer-loop iteration (§4.6 step 2) and discarded with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::mqtt::Bus;

/// Third consecutive retryable BLE failure triggers escalation (§4.5).
const ESCALATION_THRESHOLD: u32 = 3;
/// Minimum gap between two proxy-reboot commands for the same host.
const PROXY_REBOOT_COOLDOWN: Duration = Duration::from_secs(600);
/// Heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Maintenance-reconnect check cadence.
const MAINTENANCE_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Minimum uptime before a maintenance reconnect is considered.
const MAINTENANCE_MIN_UPTIME: Duration = Duration::from_secs(30 * 60);
/// Idle window that triggers a maintenance reconnect.
const MAINTENANCE_MAX_IDLE: Duration = Duration::from_secs(12 * 60 * 60);
/// Error messages longer than this are truncated before publishing (§4.5).
const MAX_ERROR_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    /// A dead-API connect failure the Command Pipeline gave up recovering from.
    DeadApi,
    /// Escalation after repeated retryable BLE failures.
    Escalation,
    /// Long-idle installation, raised by the maintenance timer (§4.5, S6).
    Maintenance,
}

impl RestartKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::DeadApi => "dead_api",
            Self::Escalation => "escalation",
            Self::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestartRequest {
    pub kind: RestartKind,
    pub reason: String,
}

#[derive(Debug, Default)]
struct MutableState {
    last_ble_success_at: Option<Instant>,
    last_error: Option<String>,
    last_command_at: Option<Instant>,
    last_command: Option<String>,
    proxy_statuses: HashMap<String, Value>,
    proxy_reboot_cooldowns: HashMap<String, Instant>,
    pending_restart: Option<RestartRequest>,
}

/// Per-outer-loop-iteration health state, counters, and the restart signal
/// the supervisor awaits.
pub struct HealthMonitor {
    started_at: Instant,
    vendor: String,
    bus: Bus,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
    restart_notify: Notify,
    state: StdMutex<MutableState>,
}

#[derive(Serialize)]
struct Heartbeat<'a> {
    #[serde(rename = "type")]
    vendor: &'a str,
    started_at_ms: u64,
    uptime_secs: u64,
    last_ble_success_secs_ago: Option<u64>,
    consecutive_failures: u32,
    last_error: Option<&'a str>,
    last_command: Option<&'a str>,
    last_command_secs_ago: Option<u64>,
    proxy_statuses: HashMap<String, Value>,
    degraded: bool,
    pending_restart_reason: Option<&'a str>,
}

impl HealthMonitor {
    pub fn new(bus: Bus, vendor: impl Into<String>) -> Self {
        Self {
            started_at: Instant::now(),
            vendor: vendor.into(),
            bus,
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            restart_notify: Notify::new(),
            state: StdMutex::new(MutableState::default()),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn record_ble_success(&self, _device: &str) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.state.lock().unwrap().last_ble_success_at = Some(Instant::now());
        self.update_degraded();
    }

    /// Records a BLE failure. Non-retryable failures reset the consecutive
    /// counter instead of growing it (§4.5 failure escalation rule 3) since
    /// they don't indicate a flaky link worth escalating on.
    pub fn record_ble_failure(&self, device: &str, error: &str, proxy_host: Option<&str>, retryable: bool) {
        let truncated: String = error.chars().take(MAX_ERROR_LEN).collect();
        {
            let mut state = self.state.lock().unwrap();
            state.last_error = Some(truncated.clone());
        }

        if !retryable {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.update_degraded();
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_degraded();

        if failures >= ESCALATION_THRESHOLD {
            warn!(device, failures, "escalating after repeated BLE failures");
            if let Some(host) = proxy_host {
                self.request_proxy_reboot(host);
            }
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.request_restart(RestartKind::Escalation, format!("{failures} consecutive BLE failures on {device}"));
        }
    }

    pub fn record_command(&self, device: &str, cmd_name: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.last_command_at = Some(Instant::now());
        state.last_command = Some(cmd_name.map(str::to_string).unwrap_or_else(|| device.to_string()));
    }

    pub fn request_restart(&self, kind: RestartKind, reason: impl Into<String>) {
        let reason = reason.into();
        info!(kind = kind.as_str(), reason = %reason, "restart requested");
        {
            let mut state = self.state.lock().unwrap();
            if state.pending_restart.is_none() {
                state.pending_restart = Some(RestartRequest { kind, reason });
            }
        }
        self.update_degraded();
        self.restart_notify.notify_waiters();
    }

    /// Publish `REBOOT` to the proxy's command topic unless it's within its
    /// 10-minute cooldown, in which case publish a `reboot_suppressed`
    /// breadcrumb instead (§4.5, §8 property 6). The cooldown test-and-set
    /// happens synchronously so callers like [`Self::record_ble_failure`]
    /// (which cannot themselves be async) can invoke it directly; the
    /// actual publish is deferred to a spawned task.
    pub fn request_proxy_reboot(&self, host: &str) {
        let monitor = self.bus.clone();
        let host = host.to_string();
        let ns = monitor.namespace().to_string();
        let should_publish = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            match state.proxy_reboot_cooldowns.get(&host) {
                Some(&last) if now.duration_since(last) < PROXY_REBOOT_COOLDOWN => {
                    Some(PROXY_REBOOT_COOLDOWN - now.duration_since(last))
                }
                _ => {
                    state.proxy_reboot_cooldowns.insert(host.clone(), now);
                    None
                }
            }
        };

        tokio::spawn(async move {
            match should_publish {
                None => {
                    if let Err(e) = monitor.publish(format!("{ns}/proxy/{host}/command"), "REBOOT", false).await {
                        warn!(host, error = %e, "failed to publish proxy reboot command");
                    }
                    let _ = monitor
                        .publish_json(
                            format!("{ns}/proxy/{host}/reboot_requested"),
                            &serde_json::json!({ "host": host }),
                            false,
                        )
                        .await;
                }
                Some(remaining) => {
                    let _ = monitor
                        .publish_json(
                            format!("{ns}/proxy/{host}/reboot_suppressed"),
                            &serde_json::json!({ "host": host, "cooldownRemainingSec": remaining.as_secs() }),
                            false,
                        )
                        .await;
                }
            }
        });
    }

    /// Best-effort ingestion of a proxy's self-reported status JSON (§4.5).
    pub fn ingest_proxy_status(&self, host: &str, payload: &[u8]) {
        if let Ok(value) = serde_json::from_slice::<Value>(payload) {
            self.state.lock().unwrap().proxy_statuses.insert(host.to_string(), value);
        }
    }

    fn update_degraded(&self) {
        let degraded = self.consecutive_failures.load(Ordering::SeqCst) > 0
            || self.state.lock().unwrap().pending_restart.is_some();
        self.degraded.store(degraded, Ordering::SeqCst);
    }

    /// A one-shot awaitable that resolves once a restart request has been
    /// accepted (§4.5 `waitForRestartRequest`).
    pub async fn wait_for_restart(&self) -> RestartRequest {
        loop {
            if let Some(req) = self.state.lock().unwrap().pending_restart.clone() {
                return req;
            }
            self.restart_notify.notified().await;
        }
    }

    async fn publish_heartbeat(&self) {
        let state = self.state.lock().unwrap();
        let ns = self.bus.namespace().to_string();
        let heartbeat = Heartbeat {
            vendor: &self.vendor,
            started_at_ms: bedlink_types::now_ms() - self.started_at.elapsed().as_millis() as u64,
            uptime_secs: self.started_at.elapsed().as_secs(),
            last_ble_success_secs_ago: state.last_ble_success_at.map(|t| t.elapsed().as_secs()),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_error: state.last_error.as_deref(),
            last_command: state.last_command.as_deref(),
            last_command_secs_ago: state.last_command_at.map(|t| t.elapsed().as_secs()),
            proxy_statuses: state.proxy_statuses.clone(),
            degraded: self.degraded.load(Ordering::SeqCst),
            pending_restart_reason: state.pending_restart.as_ref().map(|r| r.reason.as_str()),
        };
        drop(state);

        if let Err(e) = self.bus.publish_json(format!("{ns}/health"), &heartbeat, false).await {
            warn!(error = %e, "failed to publish health heartbeat");
        }
        if let Err(e) = self.bus.publish_degraded(self.degraded.load(Ordering::SeqCst)).await {
            warn!(error = %e, "failed to publish degraded flag");
        }
    }

    /// Publish a final heartbeat synchronously — used on fatal exit so the
    /// last-known state reaches the bus before the process dies (§4.6 step 7).
    pub async fn publish_final_snapshot(&self) {
        self.publish_heartbeat().await;
    }

    fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn idle_for(&self) -> Option<Duration> {
        self.state.lock().unwrap().last_command_at.map(|t| t.elapsed())
    }
}

/// Spawn the 30 s heartbeat loop. Aborted by dropping the returned handle
/// when the outer-loop iteration ends.
pub fn spawn_heartbeat(monitor: std::sync::Arc<HealthMonitor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            monitor.publish_heartbeat().await;
        }
    })
}

/// Spawn the maintenance-reconnect timer (§4.5, S6).
pub fn spawn_maintenance_timer(monitor: std::sync::Arc<HealthMonitor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(MAINTENANCE_CHECK_INTERVAL).await;
            let idle = monitor.idle_for();
            let eligible = monitor.uptime() >= MAINTENANCE_MIN_UPTIME
                && idle.map(|d| d >= MAINTENANCE_MAX_IDLE).unwrap_or(false);
            if eligible {
                monitor.request_restart(
                    RestartKind::Maintenance,
                    "uptime and idle window exceeded maintenance thresholds".to_string(),
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bus() -> Bus {
        let config = crate::config::Config {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_password: None,
            vendor: "keeson".to_string(),
            namespace: "smartbedmqtt".to_string(),
            ble_proxies: Vec::new(),
            beds: Vec::new(),
        };
        Bus::connect(&config).unwrap().0
    }

    #[test]
    fn third_consecutive_failure_requests_restart() {
        let monitor = HealthMonitor::new(test_bus(), "keeson");
        monitor.record_ble_failure("Bed1", "timeout", None, true);
        monitor.record_ble_failure("Bed1", "timeout", None, true);
        assert!(monitor.state.lock().unwrap().pending_restart.is_none());
        monitor.record_ble_failure("Bed1", "timeout", None, true);
        assert!(monitor.state.lock().unwrap().pending_restart.is_some());
    }

    #[test]
    fn success_clears_consecutive_failures() {
        let monitor = HealthMonitor::new(test_bus(), "keeson");
        monitor.record_ble_failure("Bed1", "timeout", None, true);
        monitor.record_ble_failure("Bed1", "timeout", None, true);
        monitor.record_ble_success("Bed1");
        assert_eq!(monitor.consecutive_failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn degraded_reflects_failure_count() {
        let monitor = HealthMonitor::new(test_bus(), "keeson");
        assert!(!monitor.degraded.load(Ordering::SeqCst));
        monitor.record_ble_failure("Bed1", "timeout", None, true);
        assert!(monitor.degraded.load(Ordering::SeqCst));
    }

    #[test]
    fn error_message_is_truncated() {
        let monitor = HealthMonitor::new(test_bus(), "keeson");
        let long = "x".repeat(1000);
        monitor.record_ble_failure("Bed1", &long, None, true);
        let state = monitor.state.lock().unwrap();
        assert_eq!(state.last_error.as_ref().unwrap().len(), MAX_ERROR_LEN);
    }

    #[test]
    fn non_retryable_failure_resets_counter() {
        let monitor = HealthMonitor::new(test_bus(), "keeson");
        monitor.record_ble_failure("Bed1", "not supported", None, true);
        monitor.record_ble_failure("Bed1", "not supported", None, true);
        assert_eq!(monitor.consecutive_failures.load(Ordering::SeqCst), 2);
        monitor.record_ble_failure("Bed1", "not supported", None, false);
        assert_eq!(monitor.consecutive_failures.load(Ordering::SeqCst), 0);
    }
}
