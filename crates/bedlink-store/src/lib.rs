//! Atomic JSON persistence for bedlink.
//!
//! This crate owns the two files the bridge rewrites on every meaningful
//! state change:
//!
//! - `<name>-ble-preferences.json` — per-[`bedlink_types::DeviceKey`] connect
//!   cache-mode preference.
//! - `<name>-<vendor>-controller-preferences.json` — per-bed controller
//!   success/failure stats and the pinned-controller choice.
//!
//! Both writers go through [`atomic::write_json_atomic`], so a crash
//! mid-write can never leave a half-written file behind.

mod atomic;
mod controller_stats;
mod error;
mod preferences;

pub use bedlink_types::{BedControllerFile, ConnectPreference, ControllerStats};
pub use controller_stats::ControllerStatsStore;
pub use error::{Error, Result};
pub use preferences::PreferenceStore;
