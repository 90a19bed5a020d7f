//! BLE advertisement data and the device key that scopes the connect mutex.

use serde::{Deserialize, Serialize};

/// Public vs. random BLE address, as reported by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    Public,
    Random,
}

/// `(proxy-host, 48-bit address)` — the scope of the global connect mutex
/// and the key for every per-device preference lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub proxy_host: String,
    pub address: u64,
}

impl DeviceKey {
    pub fn new(proxy_host: impl Into<String>, address: u64) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            address,
        }
    }

    /// `"<proxyHost>:<address>"` — the key shape persisted-preference files use.
    pub fn persisted_key(&self) -> String {
        format!("{}:{:012x}", self.proxy_host, self.address)
    }

    /// The 12-hex MAC form of `address`, lowercase, no separators.
    pub fn mac_hex(&self) -> String {
        format!("{:012x}", self.address)
    }
}

/// One BLE advertisement as delivered by a `ProxyLink`'s advertisement
/// stream. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleAdvertisement {
    pub name: Option<String>,
    pub address: u64,
    pub address_type: AddressType,
    pub rssi: i16,
    pub manufacturer_data: Vec<(u16, Vec<u8>)>,
    pub service_uuids: Vec<String>,
}

impl BleAdvertisement {
    /// Build a bare advertisement with no name, manufacturer data, or
    /// service UUIDs. Convenient for tests and for synthesizing the
    /// fallback "unnamed" case.
    pub fn new(address: u64, address_type: AddressType, rssi: i16) -> Self {
        Self {
            name: None,
            address,
            address_type,
            rssi,
            manufacturer_data: Vec::new(),
            service_uuids: Vec::new(),
        }
    }

    /// The name used for matching: the advertised name if present, else the
    /// 12-hex MAC (unnamed advertisements MUST still be matchable).
    pub fn effective_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{:012x}", self.address))
    }

    pub fn mac_hex(&self) -> String {
        format!("{:012x}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_key_persisted_key_is_stable() {
        let key = DeviceKey::new("10.0.0.111", 0x1122_3344_5566);
        assert_eq!(key.persisted_key(), "10.0.0.111:112233445566");
    }

    #[test]
    fn unnamed_advertisement_falls_back_to_mac() {
        let adv = BleAdvertisement {
            name: None,
            address: 0xaabbccddeeff,
            address_type: AddressType::Public,
            rssi: -70,
            manufacturer_data: Vec::new(),
            service_uuids: Vec::new(),
        };
        assert_eq!(adv.effective_name(), "aabbccddeeff");
    }
}
