//! Per-volume bookkeeping: lookup key, header metadata, and the redaction policy

use crate::error::{MedvolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Process configuration governing patient-identifying metadata.
///
/// Consulted only by [`Identifier::confirm_sensitivity`]; an explicit value
/// owned by the caller rather than an ambient global.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PrivacyPolicy {
    /// Whether assets may carry patient-identifying metadata at all
    pub allow_sensitive: bool,

    /// Whether disallowed metadata is silently redacted on confirmation
    /// instead of rejecting the asset
    pub auto_redact: bool,
}

impl Default for PrivacyPolicy {
    fn default() -> Self {
        Self {
            allow_sensitive: true,
            auto_redact: true,
        }
    }
}

impl PrivacyPolicy {
    /// Policy that rejects any asset carrying sensitive metadata
    pub fn strict() -> Self {
        Self {
            allow_sensitive: false,
            auto_redact: false,
        }
    }
}

/// Bookkeeping attached to every volume asset.
///
/// `key` is an opaque handle other parts of a program use to locate the
/// asset. `metadata` carries header tags from the source file and therefore
/// often contains patient-identifying data; the `has_sensitive_data` flag
/// tracks that. Invariant: when the flag is false the metadata map is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identifier {
    /// Opaque lookup key, empty unless assigned
    pub key: String,

    metadata: HashMap<String, String>,

    has_sensitive_data: bool,
}

impl Identifier {
    /// Identifier with an empty key and no metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier with a generated UUID key
    pub fn fresh() -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }

    /// Header metadata carried from the source file
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Look up one metadata value
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    /// Insert a metadata entry.
    ///
    /// Header tags are treated as potentially patient-identifying, so this
    /// raises the sensitivity flag; [`Identifier::confirm_sensitivity`]
    /// settles it against the caller's policy.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
        self.has_sensitive_data = true;
    }

    /// Whether the metadata map may contain patient-identifying entries
    pub fn has_sensitive_data(&self) -> bool {
        self.has_sensitive_data
    }

    /// Clear all metadata and lower the sensitivity flag, unconditionally
    pub fn redact(&mut self) {
        self.metadata.clear();
        self.has_sensitive_data = false;
    }

    /// Settle the sensitivity flag against the caller's policy.
    ///
    /// A `false` confirmation asserts the asset carries nothing sensitive;
    /// any metadata still present is cleared so the invariant holds. A
    /// `true` confirmation keeps the metadata when the policy allows it,
    /// redacts when `auto_redact` is set, and otherwise fails — sensitive
    /// data that can neither be kept nor erased is a configuration error,
    /// not a recoverable condition.
    pub fn confirm_sensitivity(&mut self, has_sensitive_data: bool, policy: &PrivacyPolicy) -> Result<()> {
        if !has_sensitive_data {
            self.redact();
            return Ok(());
        }

        self.has_sensitive_data = true;
        if policy.allow_sensitive {
            Ok(())
        } else if policy.auto_redact {
            log::info!("sensitive metadata disallowed by policy, redacting {} entries", self.metadata.len());
            self.redact();
            Ok(())
        } else {
            Err(MedvolError::SensitiveDataRejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged() -> Identifier {
        let mut id = Identifier::fresh();
        id.insert_metadata("PatientName", "DOE^JANE");
        id.insert_metadata("StudyDate", "20240115");
        id
    }

    #[test]
    fn test_fresh_keys_are_distinct() {
        assert_ne!(Identifier::fresh().key, Identifier::fresh().key);
        assert!(Identifier::new().key.is_empty());
    }

    #[test]
    fn test_insert_raises_flag() {
        let id = tagged();
        assert!(id.has_sensitive_data());
        assert_eq!(id.get_metadata("PatientName"), Some("DOE^JANE"));
    }

    #[test]
    fn test_redact_clears_everything() {
        let mut id = tagged();
        id.redact();
        assert!(!id.has_sensitive_data());
        assert!(id.metadata().is_empty());
    }

    #[test]
    fn test_confirm_false_restores_invariant() {
        let mut id = tagged();
        id.confirm_sensitivity(false, &PrivacyPolicy::default()).unwrap();
        assert!(!id.has_sensitive_data());
        assert!(id.metadata().is_empty());
    }

    #[test]
    fn test_confirm_allowed_keeps_metadata() {
        let mut id = tagged();
        id.confirm_sensitivity(true, &PrivacyPolicy::default()).unwrap();
        assert!(id.has_sensitive_data());
        assert_eq!(id.metadata().len(), 2);
    }

    #[test]
    fn test_confirm_auto_redacts() {
        let mut id = tagged();
        let policy = PrivacyPolicy {
            allow_sensitive: false,
            auto_redact: true,
        };
        id.confirm_sensitivity(true, &policy).unwrap();
        assert!(!id.has_sensitive_data());
        assert!(id.metadata().is_empty());
    }

    #[test]
    fn test_confirm_rejects_under_strict_policy() {
        let mut id = tagged();
        let err = id.confirm_sensitivity(true, &PrivacyPolicy::strict()).unwrap_err();
        assert!(matches!(err, MedvolError::SensitiveDataRejected));
    }
}
