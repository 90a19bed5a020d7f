//! Bed configuration and the derived logical bed identity.

use serde::{Deserialize, Serialize};

use crate::identity::{expand_bed_identifiers, first_hex_mac, normalize_identifier};
use crate::validate::ValidationError;

/// A user-facing configuration entry. May back one or two linked BLE
/// controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedConfig {
    pub friendly_name: String,
    pub name: String,
    #[serde(default)]
    pub stay_connected: bool,
    #[serde(default)]
    pub aliases: String,
    #[serde(default)]
    pub extra_identifiers: Vec<String>,
}

impl BedConfig {
    /// All normalized identifier variants this bed should match on: `name`,
    /// `aliases` (comma/space separated), and `extra_identifiers`, each run
    /// through [`crate::identity::identifier_variants`].
    pub fn identifier_variants(&self) -> Vec<String> {
        let mut out = expand_bed_identifiers(&self.name, &self.aliases);
        for extra in &self.extra_identifiers {
            for variant in crate::identity::identifier_variants(extra) {
                if !out.contains(&variant) {
                    out.push(variant);
                }
            }
        }
        out
    }

    /// The logical bed identity used as the key for external entity
    /// discovery topics: a 12-hex MAC extracted from `name`/`aliases` if one
    /// is present, else the lowercased `name`. Never the runtime BLE
    /// address, so a failover to a linked controller never creates a
    /// duplicate entity.
    pub fn stable_identity(&self) -> String {
        for token in self.identifier_variants() {
            if let Some(mac) = first_hex_mac(&token) {
                return mac;
            }
        }
        normalize_identifier(&self.name)
    }

    pub fn validate(&self, field_prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{field_prefix}.name"),
                "name must not be empty",
            ));
        }
        if self.friendly_name.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{field_prefix}.friendlyName"),
                "friendlyName must not be empty",
            ));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bed(name: &str, aliases: &str) -> BedConfig {
        BedConfig {
            friendly_name: "Living Room Bed".to_string(),
            name: name.to_string(),
            stay_connected: false,
            aliases: aliases.to_string(),
            extra_identifiers: Vec::new(),
        }
    }

    #[test]
    fn stable_identity_prefers_mac_in_name() {
        let b = bed("Bed-aabbccddeeff", "");
        assert_eq!(b.stable_identity(), "aabbccddeeff");
    }

    #[test]
    fn stable_identity_prefers_mac_in_aliases_over_name() {
        let b = bed("Living Room Bed", "aabbccddeeff");
        assert_eq!(b.stable_identity(), "aabbccddeeff");
    }

    #[test]
    fn stable_identity_falls_back_to_lowercased_name() {
        let b = bed("Living Room Bed", "");
        assert_eq!(b.stable_identity(), "living room bed");
    }

    #[test]
    fn stable_identity_does_not_depend_on_runtime_address() {
        // Two beds with the same configured identity must derive the same
        // stable identity regardless of which linked controller is chosen.
        let a = bed("Bed-aabbccddeeff", "");
        let b = bed("Bed-aabbccddeeff", "");
        assert_eq!(a.stable_identity(), b.stable_identity());
    }
}
