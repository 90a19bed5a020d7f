//! Shared configuration and domain types for the bedlink BLE bridge.
//!
//! This crate holds the data that every other crate in the workspace needs
//! to agree on: proxy and bed configuration, the BLE advertisement shape,
//! the `DeviceKey` that scopes the global connect mutex, and the
//! identifier-normalization / matching rules used by discovery.
//!
//! Nothing here talks to a socket. Everything is plain data plus pure
//! functions, so it can be unit tested without an event loop.

mod advertisement;
mod bed;
mod identity;
mod proxy;
mod stats;
mod validate;

pub use advertisement::{AddressType, BleAdvertisement, DeviceKey};
pub use bed::BedConfig;
pub use identity::{first_hex_mac, identifier_variants, matches_identifier, normalize_identifier};
pub use proxy::ProxyConfig;
pub use stats::{
    now_ms, BedControllerFile, BedEntry, BedMeta, ConnectPreference, ControllerStats,
};
pub use validate::ValidationError;
