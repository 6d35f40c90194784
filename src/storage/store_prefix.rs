use derive_more::{Display, From};
use thiserror::Error;

/// An abstract store prefix.
///
/// A prefix is either empty (the root) or a `/` terminated path, e.g. `prices/c/`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub struct StorePrefix(String);

/// An invalid store prefix.
#[derive(Debug, Error, From)]
#[error("invalid store prefix {0}")]
pub struct StorePrefixError(String);

/// A list of [`StorePrefix`].
pub type StorePrefixes = Vec<StorePrefix>;

impl StorePrefix {
    /// Create a new store prefix from `prefix`.
    ///
    /// # Errors
    /// Returns [`StorePrefixError`] if `prefix` is not valid according to [`StorePrefix::validate`()].
    pub fn new(prefix: impl Into<String>) -> Result<Self, StorePrefixError> {
        let prefix = prefix.into();
        if Self::validate(&prefix) {
            Ok(Self(prefix))
        } else {
            Err(StorePrefixError(prefix))
        }
    }

    /// Create the prefix holding the tensor with identifier `tensor_id`.
    ///
    /// # Errors
    /// Returns [`StorePrefixError`] if `tensor_id` does not form a valid prefix.
    pub fn for_tensor(tensor_id: &str) -> Result<Self, StorePrefixError> {
        let tensor_id = tensor_id.trim_matches('/');
        if tensor_id.is_empty() {
            return Err(StorePrefixError(String::new()));
        }
        Self::new(format!("{tensor_id}/"))
    }

    pub(crate) fn from_valid(prefix: String) -> Self {
        debug_assert!(Self::validate(&prefix));
        Self(prefix)
    }

    /// The root prefix.
    #[must_use]
    pub const fn root() -> Self {
        Self(String::new())
    }

    /// Extracts a string slice containing the prefix.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a child prefix `name/` of this prefix.
    ///
    /// # Errors
    /// Returns [`StorePrefixError`] if `name` is empty or contains a `/`.
    pub fn child(&self, name: &str) -> Result<Self, StorePrefixError> {
        if name.is_empty() || name.contains('/') {
            return Err(StorePrefixError(format!("{}{name}", self.0)));
        }
        Self::new(format!("{}{name}/", self.0))
    }

    /// Validates a prefix:
    /// - the root prefix is the empty string, otherwise
    /// - a prefix ends with a trailing `/`, does not start with `/`,
    /// - and has no empty, `.` or `..` components.
    #[must_use]
    pub fn validate(prefix: &str) -> bool {
        prefix.is_empty()
            || prefix.strip_suffix('/').is_some_and(|path| {
                !path.starts_with('/')
                    && path.split('/').all(|component| {
                        !component.is_empty() && component != "." && component != ".."
                    })
            })
    }

    /// Returns the prefix of the parent, it if has one.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let path = self.0.strip_suffix('/')?;
        Some(match path.rsplit_once('/') {
            Some((parent, _)) => Self(parent.to_string() + "/"),
            None => Self::root(),
        })
    }
}

impl TryFrom<&str> for StorePrefix {
    type Error = StorePrefixError;

    fn try_from(prefix: &str) -> Result<Self, StorePrefixError> {
        Self::new(prefix)
    }
}
