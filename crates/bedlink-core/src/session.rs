//! BLE Device Session: per-(proxy, address) connect state machine, cache-mode
//! learning, the services-discovery recovery ladder, and listener-lifecycle
//! discipline (§4.2).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use bedlink_types::{AddressType, DeviceKey};

use crate::diagnostics::SessionDiagnostics;
use crate::error::{Error, Result};
use crate::events::ProxyEvent;
use crate::link::ProxyLink;
use crate::wire::GattService;

/// Persistence port for per-device connect-mode preference. Implemented by
/// `bedlink-store`'s `PreferenceStore`; kept as a trait here so core has no
/// dependency on the persistence crate.
pub trait ConnectPreferences: Send + Sync {
    fn without_cache(&self, key: &DeviceKey) -> bool;
    fn set_without_cache(&self, key: &DeviceKey, value: bool) -> Result<bool>;
}

/// Device Session lifecycle states (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Subscribed,
    Disconnecting,
}

/// Duration after a slow/ignored connect during which subsequent connects
/// force the without-cache mode (§4.2 step 7).
const FORCE_WITHOUT_CACHE_WINDOW: Duration = Duration::from_secs(15 * 60);
/// Connect durations above this threshold arm the force-without-cache flag.
const SLOW_CONNECT_THRESHOLD: Duration = Duration::from_secs(8);
/// Cooldown armed after `mtu == 0` (ESP32 `status=133` correlate).
const MTU_ZERO_COOLDOWN: Duration = Duration::from_secs(2);
/// Cooldown armed after a proxy-reported hard BLE failure.
const HARD_FAILURE_COOLDOWN: Duration = Duration::from_secs(3);
/// Per-attempt timeout matches `ProxyLink::CONNECT_TIMEOUT`; see there.
const CLEANUP_PAUSE: Duration = Duration::from_millis(250);

/// One per-(proxy, address) session. Transient instances may be created
/// repeatedly during scan/retry loops; the global connect mutex held in
/// [`SessionRegistry`] ensures only one of them is ever mid-connect for a
/// given [`DeviceKey`].
pub struct DeviceSession {
    key: DeviceKey,
    address_type: AddressType,
    link: Arc<ProxyLink>,
    preferences: Arc<dyn ConnectPreferences>,
    state: StdMutex<SessionState>,
    diagnostics: StdMutex<SessionDiagnostics>,
    cached_services: StdMutex<Option<Vec<GattService>>>,
    notify_listeners: StdMutex<std::collections::HashSet<u16>>,
}

impl DeviceSession {
    fn new(
        key: DeviceKey,
        address_type: AddressType,
        link: Arc<ProxyLink>,
        preferences: Arc<dyn ConnectPreferences>,
    ) -> Self {
        let diagnostics = SessionDiagnostics::new(&key, address_type);
        Self {
            key,
            address_type,
            link,
            preferences,
            state: StdMutex::new(SessionState::Idle),
            diagnostics: StdMutex::new(diagnostics),
            cached_services: StdMutex::new(None),
            notify_listeners: StdMutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        self.diagnostics.lock().unwrap().clone()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Connect procedure (§4.2 steps 2-7). Assumes the caller already holds
    /// this `DeviceKey`'s global connect mutex via [`SessionRegistry::connect`].
    async fn connect_locked(&self) -> Result<()> {
        self.set_state(SessionState::Connecting);

        let cooldown_until = {
            let diag = self.diagnostics.lock().unwrap();
            diag.is_in_cooldown().then(|| diag.cooldown_until_ms)
        };
        if let Some(Some(until)) = cooldown_until {
            let now = bedlink_types::now_ms();
            if until > now {
                sleep(Duration::from_millis(until - now)).await;
            }
        }

        self.link.ready().await?;

        let force_without_cache = self.diagnostics.lock().unwrap().force_without_cache_active();
        let mut without_cache = if force_without_cache {
            true
        } else {
            self.preferences.without_cache(&self.key)
        };

        let mut last_err = None;
        for pass in 0..2 {
            let started = Instant::now();
            match self.attempt_connect(without_cache).await {
                Ok(outcome) => {
                    let duration = started.elapsed();
                    self.on_connect_success(without_cache, outcome.mtu, duration);
                    self.set_state(SessionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    warn!(device_key = %self.key.persisted_key(), error = %e, pass, "connect attempt failed");
                    self.diagnostics
                        .lock()
                        .unwrap()
                        .record_connect_failure(e.to_string());
                    last_err = Some(e);

                    if pass == 0 {
                        let _ = self.link.device_disconnect(self.key.address).await;
                        let _ = self.link.device_clear_cache(self.key.address).await;
                        sleep(CLEANUP_PAUSE).await;
                        without_cache = !without_cache;
                    }
                }
            }
        }

        self.set_state(SessionState::Idle);
        Err(last_err.unwrap_or_else(|| Error::socket("connect failed with no recorded error")))
    }

    /// One connect attempt, racing the proxy's own response against its log
    /// side-channel for the short-circuit outcomes in §4.2 step 5.
    async fn attempt_connect(&self, without_cache: bool) -> Result<crate::link::ConnectOutcome> {
        let mac = self.key.mac_hex();
        let mut log_events = self.link.subscribe_events();

        let connect_fut = self
            .link
            .device_connect(self.key.address, self.address_type, without_cache);
        tokio::pin!(connect_fut);

        loop {
            tokio::select! {
                biased;
                result = &mut connect_fut => {
                    return result;
                }
                event = log_events.recv() => {
                    match event {
                        Ok(ProxyEvent::ProxyLogLine { line }) if line.contains(&mac) => {
                            if line.contains("Connection request ignored, state: ESTABLISHED") {
                                return Ok(crate::link::ConnectOutcome { connected: true, error: 0, mtu: 23 });
                            }
                            if line.contains("Connection request ignored, state:") {
                                self.diagnostics.lock().unwrap().record_ignored_connect();
                                return Err(Error::ProxyIgnored(line));
                            }
                            if line.contains("status=133") || line.contains("reason 0x100") {
                                self.diagnostics.lock().unwrap().set_cooldown(HARD_FAILURE_COOLDOWN);
                                return Err(Error::HardFailure(line));
                            }
                        }
                        Ok(_) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    fn on_connect_success(&self, used_without_cache: bool, mtu: u16, duration: Duration) {
        let mut diag = self.diagnostics.lock().unwrap();
        diag.record_connect_success(used_without_cache, mtu, duration);
        drop(diag);

        if let Err(e) = self.preferences.set_without_cache(&self.key, used_without_cache) {
            debug!(error = %e, "failed to persist connect preference");
        }

        if duration > SLOW_CONNECT_THRESHOLD {
            self.diagnostics
                .lock()
                .unwrap()
                .set_force_without_cache(FORCE_WITHOUT_CACHE_WINDOW);
        }

        if mtu == 0 {
            self.diagnostics.lock().unwrap().set_cooldown(MTU_ZERO_COOLDOWN);
        }
    }

    /// GATT services-discovery recovery ladder (§4.2).
    pub async fn list_services(&self) -> Result<Vec<GattService>> {
        if let Some(cached) = self.cached_services.lock().unwrap().clone() {
            return Ok(cached);
        }

        match self.link.list_services(self.key.address).await {
            Ok(services) if !services.is_empty() => {
                *self.cached_services.lock().unwrap() = Some(services.clone());
                return Ok(services);
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "first list_services attempt failed, entering recovery ladder");
                return self.recover_services_via_cache_clear().await;
            }
        }

        sleep(Duration::from_millis(400)).await;
        match self.link.list_services(self.key.address).await {
            Ok(services) if !services.is_empty() => {
                *self.cached_services.lock().unwrap() = Some(services.clone());
                return Ok(services);
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "second list_services attempt failed, entering recovery ladder");
            }
        }

        self.recover_services_via_cache_clear().await
    }

    async fn recover_services_via_cache_clear(&self) -> Result<Vec<GattService>> {
        let _ = self.link.device_clear_cache(self.key.address).await;
        let _ = self.link.device_disconnect(self.key.address).await;
        self.set_state(SessionState::Idle);

        self.attempt_connect(true).await.map_err(|e| {
            Error::ble_timeout(format!("reconnect without cache during recovery: {e}"), Duration::from_secs(12))
        })?;
        self.set_state(SessionState::Connected);

        sleep(Duration::from_millis(600)).await;
        let services = self.link.list_services(self.key.address).await?;

        if services.is_empty() {
            self.cached_services.lock().unwrap().take();
            return Err(Error::ble_timeout("list_services", Duration::from_secs(12)));
        }

        if let Err(e) = self.preferences.set_without_cache(&self.key, true) {
            debug!(error = %e, "failed to persist without_cache after recovery");
        }
        *self.cached_services.lock().unwrap() = Some(services.clone());
        Ok(services)
    }

    /// Clears the cached service list. Must be called on every disconnect
    /// event for this device (§4.2 invariant).
    pub fn clear_service_cache(&self) {
        *self.cached_services.lock().unwrap() = None;
    }

    pub fn note_disconnected(&self, reason: impl Into<String>) {
        self.clear_service_cache();
        self.diagnostics.lock().unwrap().record_disconnect(reason);
        self.set_state(SessionState::Idle);
    }

    /// Best-effort proxy-side disconnect followed by [`Self::note_disconnected`].
    /// Used by the disconnect-after-idle timer and by transient-write-error
    /// recovery, where a stale proxy-side connection must be dropped before
    /// the next reconnect attempt.
    pub async fn disconnect(&self, reason: impl Into<String>) {
        let _ = self.link.device_disconnect(self.key.address).await;
        self.note_disconnected(reason);
    }

    /// Subscribe to notifications on `handle`. Deregisters any prior
    /// subscription on the same handle first so re-subscription is
    /// idempotent (§4.2).
    pub async fn subscribe_notify(&self, handle: u16) -> Result<()> {
        let already = self.notify_listeners.lock().unwrap().contains(&handle);
        if already {
            return Ok(());
        }
        self.link.subscribe_notify(self.key.address, handle).await?;
        self.notify_listeners.lock().unwrap().insert(handle);
        self.set_state(SessionState::Subscribed);
        Ok(())
    }

    pub async fn write_char(&self, handle: u16, data: Vec<u8>, with_response: bool) -> Result<()> {
        self.link
            .write_char(self.key.address, handle, data, with_response)
            .await
    }

    pub async fn read_char(&self, handle: u16) -> Result<Vec<u8>> {
        self.link.read_char(self.key.address, handle).await
    }

    /// Remove every listener this session registered. Any construction of a
    /// new Session for the same key must call this on the previous one
    /// first (enforced by `SessionRegistry`).
    pub fn cleanup(&self) {
        self.notify_listeners.lock().unwrap().clear();
        self.clear_service_cache();
        self.set_state(SessionState::Idle);
    }
}

/// Process-wide connect-mutex and session registry (§4.2, §5). At most one
/// connect attempt is ever in flight per `DeviceKey`, and constructing a new
/// `DeviceSession` for a key first cleans up whatever session previously
/// held it.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<StdMutex<HashMap<DeviceKey, Entry>>>,
}

struct Entry {
    connect_mutex: Arc<AsyncMutex<()>>,
    session: Arc<DeviceSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Obtain (constructing if necessary) the session for `key`, then
    /// connect it under the global per-key mutex. If a connect is already
    /// in flight for this key, this call awaits that same mutex and, once
    /// acquired, observes the session's resulting state rather than racing
    /// a second connect attempt.
    pub async fn connect(
        &self,
        key: DeviceKey,
        address_type: AddressType,
        link: Arc<ProxyLink>,
        preferences: Arc<dyn ConnectPreferences>,
    ) -> Result<Arc<DeviceSession>> {
        let (connect_mutex, session) = {
            let mut guard = self.inner.lock().unwrap();
            match guard.get(&key) {
                Some(entry) => (Arc::clone(&entry.connect_mutex), Arc::clone(&entry.session)),
                None => {
                    let session = Arc::new(DeviceSession::new(
                        key.clone(),
                        address_type,
                        Arc::clone(&link),
                        preferences,
                    ));
                    let connect_mutex = Arc::new(AsyncMutex::new(()));
                    guard.insert(
                        key.clone(),
                        Entry {
                            connect_mutex: Arc::clone(&connect_mutex),
                            session: Arc::clone(&session),
                        },
                    );
                    (connect_mutex, session)
                }
            }
        };

        let _guard = connect_mutex.lock().await;

        if session.state() == SessionState::Connected {
            return Ok(session);
        }

        session.connect_locked().await?;
        Ok(session)
    }

    /// Replace whatever session is registered for `key`, cleaning up the
    /// old one first (§4.2: "any construction of a new Session for the same
    /// DeviceKey first cleanup()s the previous one").
    pub fn evict(&self, key: &DeviceKey) {
        let removed = self.inner.lock().unwrap().remove(key);
        if let Some(entry) = removed {
            entry.session.cleanup();
        }
    }

    pub fn get(&self, key: &DeviceKey) -> Option<Arc<DeviceSession>> {
        self.inner.lock().unwrap().get(key).map(|e| Arc::clone(&e.session))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePreferences {
        value: AtomicBool,
    }

    impl ConnectPreferences for FakePreferences {
        fn without_cache(&self, _key: &DeviceKey) -> bool {
            self.value.load(Ordering::SeqCst)
        }

        fn set_without_cache(&self, _key: &DeviceKey, value: bool) -> Result<bool> {
            let changed = self.value.swap(value, Ordering::SeqCst) != value;
            Ok(changed)
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = SessionRegistry::new();
        let key = DeviceKey::new("10.0.0.1", 1);
        assert!(registry.get(&key).is_none());
    }

    #[test]
    fn fake_preferences_round_trip() {
        let prefs = FakePreferences {
            value: AtomicBool::new(false),
        };
        let key = DeviceKey::new("10.0.0.1", 1);
        assert!(!prefs.without_cache(&key));
        prefs.set_without_cache(&key, true).unwrap();
        assert!(prefs.without_cache(&key));
    }

    #[test]
    fn eviction_of_unknown_key_is_a_no_op() {
        let registry = SessionRegistry::new();
        let key = DeviceKey::new("10.0.0.1", 1);
        registry.evict(&key);
    }
}
