//! Error types for bedlink-core.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving a proxy link or device session.
///
/// Marked `#[non_exhaustive]` so new variants can be added without breaking
/// downstream matches.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A BLE operation was attempted before the Proxy Link reached `Ready`,
    /// and the bounded readiness wait expired.
    #[error("proxy not ready after {waited:?}")]
    ApiNotReady { waited: Duration },

    /// Transport-level failure: refused connection, reset, unreachable host,
    /// or a framing-level protocol violation.
    #[error("socket error: {0}")]
    SocketError(String),

    /// The proxy refused a connect request outright ("Connection request
    /// ignored, state: ..."). Short-circuits the current attempt.
    #[error("proxy ignored connect request: {0}")]
    ProxyIgnored(String),

    /// The proxy log side-channel reported a hard BLE stack failure
    /// (`status=133` / `reason 0x100`).
    #[error("hard BLE failure: {0}")]
    HardFailure(String),

    /// A GATT operation exhausted the services-discovery recovery ladder.
    #[error("BLE operation '{operation}' timed out after {duration:?}")]
    BleTimeout {
        operation: String,
        duration: Duration,
    },

    /// The vendor `is_supported` probe rejected every candidate controller.
    #[error("no supported controller among candidates for '{bed}'")]
    NotSupported { bed: String },

    /// Two beds in configuration normalize to the same identifier.
    #[error("duplicate identifier '{identifier}' shared by '{first}' and '{second}'")]
    DuplicateIdentifier {
        identifier: String,
        first: String,
        second: String,
    },

    /// The vendor builder produced no controller for an otherwise-matched
    /// advertisement.
    #[error("controller build failed for '{bed}': {reason}")]
    ControllerBuildFailed { bed: String, reason: String },

    /// Operation was cancelled (shutdown, superseded request).
    #[error("operation cancelled")]
    Cancelled,

    /// Write to a characteristic failed.
    #[error("write failed to handle {handle:#06x}: {reason}")]
    WriteFailed { handle: u16, reason: String },

    /// Invalid configuration supplied at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Low-level I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed frame received from a proxy.
    #[error("malformed proxy frame: {0}")]
    Framing(String),

    /// A `ConnectPreferences` or `ControllerStatsPort` implementation failed
    /// to read or persist its backing store.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl Error {
    pub fn api_not_ready(waited: Duration) -> Self {
        Self::ApiNotReady { waited }
    }

    pub fn socket(message: impl Into<String>) -> Self {
        Self::SocketError(message.into())
    }

    pub fn ble_timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::BleTimeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn not_supported(bed: impl Into<String>) -> Self {
        Self::NotSupported { bed: bed.into() }
    }

    pub fn controller_build_failed(bed: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ControllerBuildFailed {
            bed: bed.into(),
            reason: reason.into(),
        }
    }

    pub fn write_failed(handle: u16, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            handle,
            reason: reason.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Matches the socket/BLE-class of errors the supervisor treats as
    /// "trips the Health Monitor" and exits with code 1 when uncaught.
    pub fn is_socket_or_ble_class(&self) -> bool {
        matches!(
            self,
            Self::ApiNotReady { .. }
                | Self::SocketError(_)
                | Self::ProxyIgnored(_)
                | Self::HardFailure(_)
                | Self::BleTimeout { .. }
                | Self::Io(_)
                | Self::Framing(_)
        )
    }
}

/// Result type alias using bedlink-core's `Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::ble_timeout("list_services", Duration::from_secs(12));
        assert!(err.to_string().contains("list_services"));

        let err = Error::api_not_ready(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn socket_class_matches_expected_variants() {
        assert!(Error::socket("ECONNRESET").is_socket_or_ble_class());
        assert!(Error::ApiNotReady {
            waited: Duration::from_secs(5)
        }
        .is_socket_or_ble_class());
        assert!(!Error::not_supported("Bed1").is_socket_or_ble_class());
        assert!(!Error::Cancelled.is_socket_or_ble_class());
    }
}
