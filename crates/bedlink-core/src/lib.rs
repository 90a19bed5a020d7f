//! Resilient BLE control plane for adjustable-bed proxies.
//!
//! This crate owns everything below the MQTT surface: dialing and
//! authenticating with network-attached BLE proxies ([`link`]), the
//! per-device connect/subscribe state machine and its global connect mutex
//! ([`session`]), advertisement scanning and tolerant identifier matching
//! ([`discovery`]), and ranking discovered controllers against their
//! persisted history ([`scorer`]). None of it touches disk or MQTT directly
//! — persistence and the vendor command registry are injected through
//! traits ([`session::ConnectPreferences`], [`scorer::ControllerStatsPort`])
//! so this crate stays testable without a real proxy or filesystem.
//!
//! # Layering
//!
//! ```text
//! discovery  -> scans every ProxyLink's advertisement stream
//! scorer     -> ranks discovery's candidates against persisted stats
//! link       -> one TCP session to a proxy (dial, handshake, frames)
//! session    -> per-device connect/subscribe state machine, built on a link
//! diagnostics-> the observable snapshot a session exposes
//! events     -> the broadcast channel link and session events flow through
//! retry      -> the backoff engine most outer loops are built from
//! ratelog    -> de-duplicated warnings for noisy, expected failure classes
//! wire       -> the proxy's length-prefixed JSON framing
//! error      -> the error taxonomy shared across all of the above
//! ```

pub mod diagnostics;
pub mod discovery;
pub mod error;
pub mod events;
pub mod link;
pub mod ratelog;
pub mod retry;
pub mod scorer;
pub mod session;
pub mod wire;

pub use diagnostics::SessionDiagnostics;
pub use discovery::{scan_once, scan_with_self_heal, ScanResult, SCAN_WINDOW};
pub use error::{Error, Result};
pub use events::{EventDispatcher, EventReceiver, ProxyEvent};
pub use link::{ConnectOutcome, LinkState, ProxyLink, CONNECT_TIMEOUT, OPEN_TIMEOUT, READINESS_TIMEOUT};
pub use ratelog::RateLimitedLog;
pub use retry::{with_retry, RetryConfig};
pub use scorer::{rank, score, select_first_supported, Candidate, ControllerStatsPort};
pub use session::{ConnectPreferences, DeviceSession, SessionRegistry, SessionState};
pub use wire::{GattCharacteristic, GattService, ProxyRequest, ProxyResponse};
