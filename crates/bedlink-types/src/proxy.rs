//! Proxy configuration: one entry per network-attached BLE proxy.

use serde::{Deserialize, Serialize};

use crate::validate::ValidationError;

/// Configuration for one BLE proxy, loaded once at startup.
///
/// `expected_server_name` is intentionally not `pub(crate)`-locked to
/// immutable: the Proxy Link is allowed to correct it at runtime when the
/// proxy presents a different name (see the name-mismatch auto-correction
/// rule), so callers hold this behind a lock rather than treating it as
/// `Copy`-able config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub expected_server_name: Option<String>,
}

fn default_port() -> u16 {
    6053
}

impl ProxyConfig {
    pub fn validate(&self, field_prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.host.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{field_prefix}.host"),
                "host must not be empty",
            ));
        }
        if self.port == 0 {
            errors.push(ValidationError::new(
                format!("{field_prefix}.port"),
                "port must be non-zero",
            ));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_host() {
        let cfg = ProxyConfig {
            host: "  ".to_string(),
            port: 6053,
            password: None,
            encryption_key: None,
            expected_server_name: None,
        };
        assert_eq!(cfg.validate("proxy").len(), 1);
    }

    #[test]
    fn accepts_minimal_config() {
        let cfg = ProxyConfig {
            host: "10.0.0.111".to_string(),
            port: 6053,
            password: None,
            encryption_key: None,
            expected_server_name: None,
        };
        assert!(cfg.validate("proxy").is_empty());
    }
}
