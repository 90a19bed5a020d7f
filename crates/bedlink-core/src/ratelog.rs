//! Keyed de-duplication window for noisy failure messages.
//!
//! Proxy sockets and BLE stacks can fail the same way dozens of times a
//! minute during a wedge. Logging every occurrence at `warn` drowns the
//! signal the Health Monitor actually needs. `RateLimitedLog` remembers the
//! last time each key fired and suppresses repeats inside a window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default suppression window: one log line per key per 30 s.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

/// A de-duplicating gate keyed by an arbitrary string (device key, proxy
/// host, error message prefix, ...).
pub struct RateLimitedLog {
    window: Duration,
    last_fired: Mutex<HashMap<String, Instant>>,
}

impl RateLimitedLog {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` the first time `key` is seen, and again every time the
    /// window has elapsed since its last `true`. Callers should only emit a
    /// log line when this returns `true`.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut guard = self.last_fired.lock().unwrap();
        match guard.get(key) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                guard.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop all remembered keys. Useful at the start of a fresh supervisor
    /// cycle so the next occurrence of every key logs once regardless of
    /// what happened in the previous cycle.
    pub fn reset(&self) {
        self.last_fired.lock().unwrap().clear();
    }
}

impl Default for RateLimitedLog {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_occurrence_always_logs() {
        let log = RateLimitedLog::new(Duration::from_secs(60));
        assert!(log.should_log("proxy:10.0.0.50"));
    }

    #[test]
    fn repeat_within_window_is_suppressed() {
        let log = RateLimitedLog::new(Duration::from_secs(60));
        assert!(log.should_log("proxy:10.0.0.50"));
        assert!(!log.should_log("proxy:10.0.0.50"));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let log = RateLimitedLog::new(Duration::from_secs(60));
        assert!(log.should_log("a"));
        assert!(log.should_log("b"));
    }

    #[test]
    fn reset_clears_suppression() {
        let log = RateLimitedLog::new(Duration::from_secs(60));
        assert!(log.should_log("a"));
        assert!(!log.should_log("a"));
        log.reset();
        assert!(log.should_log("a"));
    }

    #[test]
    fn elapsed_window_allows_logging_again() {
        let log = RateLimitedLog::new(Duration::from_millis(10));
        assert!(log.should_log("a"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(log.should_log("a"));
    }
}
