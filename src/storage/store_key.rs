use derive_more::{Display, From};
use thiserror::Error;

use super::StorePrefix;

/// An abstract store key.
///
/// A key is a `/` separated path that does not start or end with `/`, e.g. `prices/c/0/1`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub struct StoreKey(String);

/// An invalid store key.
#[derive(Debug, From, Error)]
#[error("invalid store key {0}")]
pub struct StoreKeyError(String);

/// A list of [`StoreKey`].
pub type StoreKeys = Vec<StoreKey>;

impl StoreKey {
    /// Create a new store key from `key`.
    ///
    /// # Errors
    /// Returns [`StoreKeyError`] if `key` is not valid according to [`StoreKey::validate()`].
    pub fn new(key: impl Into<String>) -> Result<Self, StoreKeyError> {
        let key = key.into();
        if Self::validate(&key) {
            Ok(Self(key))
        } else {
            Err(StoreKeyError(key))
        }
    }

    /// Create the key `name` under `prefix`.
    ///
    /// # Errors
    /// Returns [`StoreKeyError`] if the joined key is not valid.
    pub fn under(prefix: &StorePrefix, name: &str) -> Result<Self, StoreKeyError> {
        Self::new(format!("{}{name}", prefix.as_str()))
    }

    /// Extracts a string slice of the underlying key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validates a key:
    /// - a key is a non-empty Unicode string,
    /// - it does not start or end with `/`, and
    /// - no path component is empty, `.` or `..`.
    #[must_use]
    pub fn validate(key: &str) -> bool {
        !key.is_empty()
            && !key.starts_with('/')
            && !key.ends_with('/')
            && key
                .split('/')
                .all(|component| !component.is_empty() && component != "." && component != "..")
    }

    /// Returns true if the key has prefix `prefix`.
    #[must_use]
    pub fn has_prefix(&self, prefix: &StorePrefix) -> bool {
        self.0.starts_with(prefix.as_str())
    }

    /// Returns the key relative to `prefix`, if it is under `prefix`.
    #[must_use]
    pub fn strip_prefix(&self, prefix: &StorePrefix) -> Option<&str> {
        self.0.strip_prefix(prefix.as_str())
    }

    /// Convert to a [`StorePrefix`].
    #[must_use]
    pub fn to_prefix(&self) -> StorePrefix {
        StorePrefix::from_valid(self.0.clone() + "/")
    }

    /// Returns the parent of this key.
    #[must_use]
    pub fn parent(&self) -> StorePrefix {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => StorePrefix::from_valid(parent.to_string() + "/"),
            None => StorePrefix::root(),
        }
    }
}

impl TryFrom<&str> for StoreKey {
    type Error = StoreKeyError;

    fn try_from(key: &str) -> Result<Self, Self::Error> {
        Self::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_key() {
        assert!(StoreKey::new("a").is_ok());
        assert_eq!(StoreKey::new("a").unwrap().to_string(), "a");
        assert!(StoreKey::new("a/").is_err());
        assert_eq!(
            StoreKey::new("a/").unwrap_err().to_string(),
            "invalid store key a/"
        );
        assert!(StoreKey::new("/a").is_err());
        assert!(StoreKey::new("a//b").is_err());
        assert!(StoreKey::new("a/../b").is_err());
        assert_eq!(
            StoreKey::new("a").unwrap().to_prefix(),
            StorePrefix::new("a/").unwrap()
        );
        assert_eq!(
            StoreKey::new("a/b").unwrap().parent(),
            StorePrefix::new("a/").unwrap()
        );
        assert_eq!(
            StoreKey::new("a").unwrap().parent(),
            StorePrefix::new("").unwrap()
        );
    }

    #[test]
    fn store_key_under() {
        let prefix = StorePrefix::new("prices/").unwrap();
        let key = StoreKey::under(&prefix, "zarr.json").unwrap();
        assert_eq!(key.as_str(), "prices/zarr.json");
        assert_eq!(key.strip_prefix(&prefix), Some("zarr.json"));
        assert!(StoreKey::under(&prefix, "").is_err());
    }
}
