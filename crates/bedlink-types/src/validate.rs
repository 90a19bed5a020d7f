//! Shared validation error shape, reused by every config-bearing type.

use std::fmt;

/// A single field-level validation failure.
///
/// Collected in a `Vec` rather than returned eagerly so that configuration
/// loading can report every problem in one pass instead of forcing the
/// operator through a fix-one-rerun cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `bleProxies[0].host`.
    pub field: String,
    /// Human-readable description of what's wrong.
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

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
