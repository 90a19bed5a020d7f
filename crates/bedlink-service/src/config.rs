//! Add-on configuration: Home Assistant add-on options JSON, loaded once at
//! startup and validated against a schema before use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use bedlink_types::BedConfig;

/// One network-attached BLE proxy this add-on dials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEntryConfig {
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub expected_server_name: Option<String>,
}

fn default_proxy_port() -> u16 {
    6053
}

/// Placeholder literal the launcher substitutes with a discovered value
/// (§6).
pub const AUTO_DETECT: &str = "<auto_detect>";

/// Top-level add-on configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_user: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    /// Selects the vendor family (e.g. `"keeson"`). Only meaningful to the
    /// command-pipeline/entity layer; this crate does not interpret it.
    #[serde(rename = "type")]
    pub vendor: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub ble_proxies: Vec<ProxyEntryConfig>,
    #[serde(default)]
    pub beds: Vec<BedConfig>,
}

fn default_mqtt_host() -> String {
    AUTO_DETECT.to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_namespace() -> String {
    "smartbedmqtt".to_string()
}

impl Config {
    /// Load raw JSON from `path` without validating or post-processing it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Load, apply `<auto_detect>`/localhost substitution, then validate.
    /// Mirrors `Config::load_validated` in spirit, but post-processing runs
    /// strictly between parse and validate, exactly once (§6 ambient stack).
    pub fn load_validated<P: AsRef<Path>>(
        path: P,
        discovered_mqtt_host: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.resolve_auto_detect(discovered_mqtt_host);
        config.validate()?;
        Ok(config)
    }

    /// Replace `<auto_detect>` fields with `discovered_mqtt_host` (falling
    /// back to `172.30.32.1` if discovery itself failed), and replace a
    /// discovered `localhost`/`127.0.0.1` with `core-mosquitto` — the Home
    /// Assistant supervisor's internal broker hostname (§6).
    pub fn resolve_auto_detect(&mut self, discovered_mqtt_host: Option<&str>) {
        if self.mqtt_host != AUTO_DETECT {
            return;
        }

        let resolved = match discovered_mqtt_host {
            Some("localhost") | Some("127.0.0.1") => "core-mosquitto",
            Some(host) => host,
            None => "172.30.32.1",
        };
        self.mqtt_host = resolved.to_string();
    }

    /// Validate the configuration, including the configured beds'
    /// duplicate-identifier guard (§7 `DuplicateIdentifier`, fatal).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.mqtt_host.trim().is_empty() {
            errors.push(ValidationError::new("mqttHost", "must not be empty"));
        }
        if self.vendor.trim().is_empty() {
            errors.push(ValidationError::new("type", "must not be empty"));
        }
        if self.ble_proxies.is_empty() {
            errors.push(ValidationError::new("bleProxies", "must list at least one proxy"));
        }
        for (i, proxy) in self.ble_proxies.iter().enumerate() {
            if proxy.host.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("bleProxies[{i}].host"),
                    "must not be empty",
                ));
            }
        }

        for (i, bed) in self.beds.iter().enumerate() {
            errors.extend(bed.validate(&format!("beds[{i}]")).into_iter().map(|e| {
                ValidationError::new(e.field, e.message)
            }));
        }

        if let Err(dup) = self.check_duplicate_identifiers() {
            errors.push(dup);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Two beds whose configured identifiers normalize to the same token are
    /// a fatal configuration error (§7 `DuplicateIdentifier`, §9 design note
    /// 2: the substring-tolerant matcher can cross-match, so this guard is
    /// the intended defense).
    fn check_duplicate_identifiers(&self) -> Result<(), ValidationError> {
        let mut seen: std::collections::HashMap<String, &str> = std::collections::HashMap::new();
        for bed in &self.beds {
            for identifier in bed.identifier_variants() {
                if let Some(&first) = seen.get(&identifier) {
                    if first != bed.friendly_name {
                        return Err(ValidationError::new(
                            "beds",
                            format!(
                                "duplicate identifier '{identifier}' shared by '{first}' and '{}'",
                                bed.friendly_name
                            ),
                        ));
                    }
                } else {
                    seen.insert(identifier, &bed.friendly_name);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n")
}

/// The Home Assistant add-on options file path.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("/data/options.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config {
            mqtt_host: AUTO_DETECT.to_string(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_password: None,
            vendor: "keeson".to_string(),
            namespace: "smartbedmqtt".to_string(),
            ble_proxies: vec![ProxyEntryConfig {
                host: "10.0.0.111".to_string(),
                port: 6053,
                password: None,
                encryption_key: None,
                expected_server_name: None,
            }],
            beds: vec![BedConfig {
                friendly_name: "Living Room Bed".to_string(),
                name: "Bed-aabbccddeeff".to_string(),
                stay_connected: false,
                aliases: String::new(),
                extra_identifiers: Vec::new(),
            }],
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn missing_proxies_is_fatal() {
        let mut config = sample_config();
        config.ble_proxies.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_identifiers_are_fatal() {
        let mut config = sample_config();
        config.beds.push(BedConfig {
            friendly_name: "Bedroom Bed".to_string(),
            name: "Bed-aabbccddeeff".to_string(),
            stay_connected: false,
            aliases: String::new(),
            extra_identifiers: Vec::new(),
        });
        let result = config.validate();
        assert!(result.is_err());
        if let Err(ConfigError::Validation(errors)) = result {
            assert!(errors.iter().any(|e| e.message.contains("duplicate identifier")));
        }
    }

    #[test]
    fn auto_detect_resolves_to_discovered_host() {
        let mut config = sample_config();
        config.resolve_auto_detect(Some("10.0.0.5"));
        assert_eq!(config.mqtt_host, "10.0.0.5");
    }

    #[test]
    fn auto_detect_maps_localhost_to_core_mosquitto() {
        let mut config = sample_config();
        config.resolve_auto_detect(Some("127.0.0.1"));
        assert_eq!(config.mqtt_host, "core-mosquitto");
    }

    #[test]
    fn auto_detect_falls_back_when_discovery_fails() {
        let mut config = sample_config();
        config.resolve_auto_detect(None);
        assert_eq!(config.mqtt_host, "172.30.32.1");
    }

    #[test]
    fn already_resolved_host_is_untouched() {
        let mut config = sample_config();
        config.mqtt_host = "broker.local".to_string();
        config.resolve_auto_detect(Some("10.0.0.5"));
        assert_eq!(config.mqtt_host, "broker.local");
    }

    #[test]
    fn load_nonexistent_file_errors() {
        let result = Config::load("/nonexistent/options.json");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
