//! Store key locks.
//!
//! A [`StoreLocks`] hands out one mutex per [`StoreKey`]. Tensor writers hold the mutex of the tensor
//! metadata key for the whole read-modify-write cycle, so concurrent writers to the same tensor are
//! serialised while writers to different tensors proceed independently.
//!
//! - [`DefaultStoreLocks`] serialise threads within a process,
//! - [`FileStoreLocks`] additionally serialise processes through advisory lock files, and
//! - [`DisabledStoreLocks`] do nothing, for single-writer use.

use std::sync::Arc;

use super::{StorageError, StoreKey};

mod default_locks;
mod disabled_locks;
mod file_locks;

pub use default_locks::{DefaultStoreLocks, DefaultStoreMutex, DefaultStoreMutexGuard};
pub use disabled_locks::{DisabledStoreLocks, DisabledStoreMutex, DisabledStoreMutexGuard};
pub use file_locks::{FileStoreLocks, FileStoreMutex, FileStoreMutexGuard};

/// Store key lock manager.
pub type StoreLocks = Arc<dyn StoreLocksTraits>;

/// Traits for store key lock managers.
pub trait StoreLocksTraits: Send + Sync + core::fmt::Debug {
    /// Returns the mutex for the store value at `key`.
    #[must_use]
    fn mutex(&self, key: &StoreKey) -> StoreKeyMutex;
}

/// Mutex for a store key.
pub type StoreKeyMutex = Box<dyn StoreKeyMutexTraits>;

/// Traits for a store key mutex.
pub trait StoreKeyMutexTraits {
    /// Acquires the mutex, blocking the current thread until it is able to do so.
    ///
    /// When the returned guard goes out of scope, the mutex will be unlocked.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the underlying lock could not be acquired.
    fn lock(&self) -> Result<StoreKeyMutexGuard<'_>, StorageError>;
}

/// Store key mutex guard.
pub type StoreKeyMutexGuard<'a> = Box<dyn StoreKeyMutexGuardTraits + 'a>;

/// Traits for a store key mutex guard.
pub trait StoreKeyMutexGuardTraits {}
