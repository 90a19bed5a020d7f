//! Top-level error type for the bedlink-service binary.
//!
//! Wraps the lower crates' errors and adds the classification the
//! supervisor needs at the process boundary (§7): configuration failures
//! are always fatal, everything else is classified socket/BLE-class or not
//! via [`Error::is_socket_or_ble_class`] so `main` can choose exit code 1
//! vs 2.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] bedlink_core::Error),

    #[error(transparent)]
    Store(#[from] bedlink_store::Error),

    #[error("mqtt error: {0}")]
    Mqtt(String),
}

impl Error {
    pub fn mqtt(message: impl Into<String>) -> Self {
        Self::Mqtt(message.into())
    }

    /// Whether this is a socket/BLE-class failure per §7 — exit code 1
    /// rather than 2 when it escapes uncaught.
    pub fn is_socket_or_ble_class(&self) -> bool {
        match self {
            Self::Core(e) => e.is_socket_or_ble_class(),
            Self::Mqtt(_) => true,
            Self::Config(_) | Self::Store(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
