//! Key/value storage underneath chunked tensors.
//!
//! A store is a flat mapping of [`StoreKey`] to bytes with a directory-like view through
//! [`StorePrefix`]. Tensors are laid out under a prefix named after the tensor identifier.
//!
//! This module defines the abstract store interfaces, includes a [memory](store::MemoryStore) and a
//! [filesystem](store::FilesystemStore) store, and the [store locks](store_lock) used to serialise
//! writers.

mod storage_sync;
pub mod store;
mod store_key;
pub mod store_lock;
mod store_prefix;

use std::{path::PathBuf, sync::Arc};

use thiserror::Error;

pub use store_key::{StoreKey, StoreKeyError, StoreKeys};
pub use store_prefix::{StorePrefix, StorePrefixError, StorePrefixes};

pub use self::storage_sync::{
    copy_prefix, ListableStorageTraits, ReadableListableStorageTraits, ReadableStorageTraits,
    ReadableWritableListableStorageTraits, ReadableWritableStorageTraits, WritableStorageTraits,
};

pub use bytes::Bytes;

/// An optional byte value.
pub type MaybeBytes = Option<Bytes>;

/// [`Arc`] wrapped readable storage.
pub type ReadableStorage = Arc<dyn ReadableStorageTraits>;

/// [`Arc`] wrapped readable and writable storage.
pub type ReadableWritableStorage = Arc<dyn ReadableWritableStorageTraits>;

/// [`Arc`] wrapped readable, writable, and listable storage.
pub type ReadableWritableListableStorage = Arc<dyn ReadableWritableListableStorageTraits>;

/// [`StoreKeys`] and [`StorePrefixes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreKeysPrefixes {
    keys: StoreKeys,
    prefixes: StorePrefixes,
}

impl StoreKeysPrefixes {
    /// Create a new [`StoreKeysPrefixes`].
    #[must_use]
    pub fn new(keys: StoreKeys, prefixes: StorePrefixes) -> Self {
        Self { keys, prefixes }
    }

    /// Returns the keys.
    #[must_use]
    pub const fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Returns the prefixes.
    #[must_use]
    pub const fn prefixes(&self) -> &StorePrefixes {
        &self.prefixes
    }
}

/// A storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A write operation was attempted on a read only store.
    #[error("a write operation was attempted on a read only store")]
    ReadOnly,
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// An invalid store prefix.
    #[error(transparent)]
    StorePrefixError(#[from] StorePrefixError),
    /// An invalid store key.
    #[error(transparent)]
    InvalidStoreKey(#[from] StoreKeyError),
    /// A lock could not be acquired.
    #[error("failed to lock {0}: {1}")]
    Lock(StoreKey, String),
    /// The store has no lock directory for cross-process locks.
    #[error("no lock directory at {0}")]
    MissingLockDirectory(PathBuf),
    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{store::MemoryStore, *};

    #[test]
    fn copy_prefix_between_stores() -> Result<(), Box<dyn Error>> {
        let source = MemoryStore::new();
        source.set(&"a/zarr.json".try_into()?, Bytes::from_static(b"{}"))?;
        source.set(&"a/c/0".try_into()?, Bytes::from_static(&[1, 2]))?;
        source.set(&"b/c/0".try_into()?, Bytes::from_static(&[3]))?;
        let destination = MemoryStore::new();
        let copied = copy_prefix(&source, &destination, &"a/".try_into()?)?;
        assert_eq!(copied, 2);
        assert_eq!(
            destination.get(&"a/c/0".try_into()?)?,
            Some(Bytes::from_static(&[1, 2]))
        );
        assert!(destination.get(&"b/c/0".try_into()?)?.is_none());
        Ok(())
    }

    #[test]
    fn storage_error_display() {
        let err = StorageError::from("disk full");
        assert_eq!(err.to_string(), "disk full");
        let err = StorageError::from(StoreKey::new("a/").unwrap_err());
        assert_eq!(err.to_string(), "invalid store key a/");
    }
}
