use serde::{Deserialize, Serialize};
use std::fmt;

use crate::offline_store::StoreError;

pub const MAX_KEY_LENGTH: usize = 128;
const QUARANTINE_SUFFIX: &str = ".quarantine";

/// Validated key into durable local storage.
///
/// Keys double as file names for [`crate::offline_store::FileStorage`], so
/// the accepted alphabet is deliberately narrow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(key: impl Into<String>) -> Result<Self, StoreError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sibling key holding entries that could not be decoded.
    pub fn quarantine(&self) -> Self {
        Self(format!("{}{}", self.0, QUARANTINE_SUFFIX))
    }

    fn validate_key(key: &str) -> Result<(), StoreError> {
        let invalid = |reason: &str| StoreError::InvalidKey {
            key: key.chars().take(50).collect(),
            reason: reason.to_string(),
        };

        if key.trim().is_empty() {
            return Err(invalid("key cannot be empty"));
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(invalid(&format!(
                "key exceeds maximum length of {} bytes",
                MAX_KEY_LENGTH
            )));
        }

        if key.contains("..") {
            return Err(invalid("key cannot contain path traversal sequences"));
        }

        if key.starts_with('.') {
            return Err(invalid("key cannot start with a dot"));
        }

        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(invalid("allowed characters are a-z, A-Z, 0-9, -, _ and ."));
        }

        Ok(())
    }
}

impl TryFrom<String> for StorageKey {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_default_queue_key() {
        let key = StorageKey::new("madadgar-offline-queue").unwrap();
        assert_eq!(key.as_str(), "madadgar-offline-queue");
        assert_eq!(
            key.quarantine().as_str(),
            "madadgar-offline-queue.quarantine"
        );
    }

    #[test]
    fn rejects_unsafe_keys() {
        for bad in ["", "   ", "../etc/passwd", ".hidden", "a/b", "a\\b", "nul\0", "sp ace"] {
            assert!(
                matches!(StorageKey::new(bad), Err(StoreError::InvalidKey { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!(StorageKey::new("k".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }
}
