//! Command Pipeline (§4.4): a per-controller FIFO of GATT writes, with
//! transient-error retry, repeating-command coalescing, an idle-disconnect
//! timer, and ESPHome-reconnect-window tolerance on the retry path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use bedlink_core::DeviceSession;

use crate::health::{HealthMonitor, RestartKind};

/// Connect-failure substrings the ESPHome reconnect window tolerates with a
/// bounded retry before surfacing (§4.4).
const RECONNECT_TOLERANT: &[&str] = &["esphome api not ready", "not connected", "not authorized", "socket is not connected"];
/// Connect-failure substrings that mean the proxy's API session is dead and
/// a full restart (not just a reconnect) is required.
const DEAD_API: &[&str] = &[
    "econnreset",
    "err_stream_write_after_end",
    "write after end",
    "bad format",
    "unknown protocol selected by server",
];
/// Write-failure substrings treated as transient (§4.4).
const TRANSIENT_WRITE: &[&str] = &["not connected", "disconnected", "gatt", "timeout", "busy", "reset"];

const TRANSIENT_RECONNECT_PAUSE: Duration = Duration::from_millis(300);
const IDLE_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const RECONNECT_RETRY_DELAYS: [Duration; 3] = [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

fn is_transient_write_error(e: &bedlink_core::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    TRANSIENT_WRITE.iter().any(|s| msg.contains(s)) || e.is_socket_or_ble_class()
}

fn matches_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Reconnects the pipeline's controller and returns the fresh session.
/// Bound to a `SessionRegistry`/`ProxyLink`/preferences triple by whoever
/// constructs the pipeline, so this crate need not depend on how those are
/// wired up for a given bed.
pub type ReconnectFn = Arc<dyn Fn() -> BoxFuture<'static, bedlink_core::Result<Arc<DeviceSession>>> + Send + Sync>;

struct RepeatState {
    command: Vec<u8>,
    handle: u16,
    remaining: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

/// The FIFO command queue for one controller. `write_lock` is the FIFO:
/// every write (single or repeating tick) serializes through it in arrival
/// order, matching §8 property 2.
pub struct CommandPipeline {
    session: StdMutex<Arc<DeviceSession>>,
    reconnect: ReconnectFn,
    health: Arc<HealthMonitor>,
    friendly_name: String,
    proxy_host: String,
    stay_connected: bool,
    write_lock: AsyncMutex<()>,
    repeat: StdMutex<Option<RepeatState>>,
    idle_timer: StdMutex<Option<JoinHandle<()>>>,
}

impl CommandPipeline {
    pub fn new(
        session: Arc<DeviceSession>,
        reconnect: ReconnectFn,
        health: Arc<HealthMonitor>,
        friendly_name: impl Into<String>,
        proxy_host: impl Into<String>,
        stay_connected: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            session: StdMutex::new(session),
            reconnect,
            health,
            friendly_name: friendly_name.into(),
            proxy_host: proxy_host.into(),
            stay_connected,
            write_lock: AsyncMutex::new(()),
            repeat: StdMutex::new(None),
            idle_timer: StdMutex::new(None),
        })
    }

    /// Write `data` to `handle` once, with the transient-error retry ladder.
    pub async fn write(self: &Arc<Self>, handle: u16, data: Vec<u8>, with_response: bool) -> crate::error::Result<()> {
        self.write_once_with_retry(handle, data, with_response).await
    }

    /// Write `data` to `handle` `count` times, `wait` apart, coalescing with
    /// any already-pending identical repeating command (§4.4, S4).
    pub async fn write_repeating(
        self: &Arc<Self>,
        handle: u16,
        data: Vec<u8>,
        with_response: bool,
        count: u32,
        wait: Duration,
    ) -> crate::error::Result<()> {
        if count <= 1 {
            return self.write_once_with_retry(handle, data, with_response).await;
        }

        let mut guard = self.repeat.lock().unwrap();
        if let Some(existing) = guard.as_ref() {
            if existing.handle == handle && existing.command == data {
                existing.remaining.fetch_add(count, Ordering::SeqCst);
                return Ok(());
            }
            existing.task.abort();
        }

        let remaining = Arc::new(AtomicU32::new(count));
        let pipeline = Arc::clone(self);
        let remaining_for_task = Arc::clone(&remaining);
        let data_for_task = data.clone();

        let task = tokio::spawn(async move {
            loop {
                let current = remaining_for_task.load(Ordering::SeqCst);
                if current == 0 {
                    break;
                }
                remaining_for_task.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = pipeline.write_once_with_retry(handle, data_for_task.clone(), with_response).await {
                    warn!(error = %e, "repeating command tick failed");
                }
                if remaining_for_task.load(Ordering::SeqCst) == 0 {
                    break;
                }
                sleep(wait).await;
            }
        });

        *guard = Some(RepeatState {
            command: data,
            handle,
            remaining,
            task,
        });
        Ok(())
    }

    async fn write_once_with_retry(self: &Arc<Self>, handle: u16, data: Vec<u8>, with_response: bool) -> crate::error::Result<()> {
        let _permit = self.write_lock.lock().await;
        let session = self.session.lock().unwrap().clone();

        match session.write_char(handle, data.clone(), with_response).await {
            Ok(()) => {
                self.on_write_success();
                return Ok(());
            }
            Err(e) if is_transient_write_error(&e) => {
                warn!(controller = %self.friendly_name, error = %e, "transient write failure, reconnecting once");
                session.disconnect("transient write failure").await;
                sleep(TRANSIENT_RECONNECT_PAUSE).await;

                let reconnected = match self.reconnect_with_tolerance().await {
                    Ok(s) => s,
                    Err(e2) => {
                        let retryable = is_transient_write_error(&e2);
                        self.health.record_ble_failure(&self.friendly_name, &e2.to_string(), Some(&self.proxy_host), retryable);
                        return Err(e2.into());
                    }
                };
                *self.session.lock().unwrap() = Arc::clone(&reconnected);

                match reconnected.write_char(handle, data, with_response).await {
                    Ok(()) => {
                        self.on_write_success();
                        Ok(())
                    }
                    Err(e2) => {
                        let retryable = is_transient_write_error(&e2);
                        self.health.record_ble_failure(&self.friendly_name, &e2.to_string(), Some(&self.proxy_host), retryable);
                        Err(e2.into())
                    }
                }
            }
            Err(e) => {
                self.health.record_ble_failure(&self.friendly_name, &e.to_string(), Some(&self.proxy_host), false);
                Err(e.into())
            }
        }
    }

    fn on_write_success(&self) {
        self.health.record_ble_success(&self.friendly_name);
        self.health.record_command(&self.friendly_name, None);
        self.arm_idle_disconnect();
    }

    /// Reconnect, tolerating the ESPHome reconnect window (§4.4) and
    /// escalating to a full restart request on a dead-API signature.
    async fn reconnect_with_tolerance(&self) -> bedlink_core::Result<Arc<DeviceSession>> {
        let mut last_err = None;
        for delay in RECONNECT_RETRY_DELAYS {
            match (self.reconnect)().await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    let msg = e.to_string().to_lowercase();
                    if matches_any(&msg, DEAD_API) {
                        self.health.request_restart(RestartKind::DeadApi, format!("dead API session for {}: {msg}", self.friendly_name));
                        return Err(e);
                    }
                    if matches_any(&msg, RECONNECT_TOLERANT) {
                        debug!(controller = %self.friendly_name, error = %msg, "reconnect attempt failed, retrying within tolerance window");
                        last_err = Some(e);
                        sleep(delay).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| bedlink_core::Error::socket("reconnect failed with no recorded error")))
    }

    /// (Re)arm the 60 s disconnect-after-idle timer (§4.4). No-op when the
    /// controller is configured to stay connected.
    fn arm_idle_disconnect(&self) {
        if self.stay_connected {
            return;
        }
        let mut guard = self.idle_timer.lock().unwrap();
        if let Some(old) = guard.take() {
            old.abort();
        }
        let session = self.session.lock().unwrap().clone();
        let friendly_name = self.friendly_name.clone();
        let task = tokio::spawn(async move {
            sleep(IDLE_DISCONNECT_TIMEOUT).await;
            debug!(controller = %friendly_name, "disconnect-after-idle timer fired");
            session.disconnect("idle timeout").await;
        });
        *guard = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_write_errors_are_detected_by_substring() {
        assert!(is_transient_write_error(&bedlink_core::Error::write_failed(1, "Device not connected")));
        assert!(is_transient_write_error(&bedlink_core::Error::write_failed(1, "GATT error 133")));
        assert!(is_transient_write_error(&bedlink_core::Error::write_failed(1, "operation busy")));
        assert!(!is_transient_write_error(&bedlink_core::Error::not_supported("Bed1")));
    }

    #[test]
    fn dead_api_messages_are_recognized() {
        assert!(matches_any("econnreset", DEAD_API));
        assert!(matches_any("write after end", DEAD_API));
        assert!(!matches_any("esphome api not ready", DEAD_API));
    }

    #[test]
    fn reconnect_tolerant_messages_are_recognized() {
        assert!(matches_any("esphome api not ready", RECONNECT_TOLERANT));
        assert!(matches_any("socket is not connected", RECONNECT_TOLERANT));
        assert!(!matches_any("bad format", RECONNECT_TOLERANT));
    }
}
