//! In-process store locks.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, MutexGuard};

use crate::storage::{StorageError, StoreKey};

use super::{
    StoreKeyMutex, StoreKeyMutexGuard, StoreKeyMutexGuardTraits, StoreKeyMutexTraits,
    StoreLocksTraits,
};

/// Default store mutex guard.
#[derive(Debug)]
pub struct DefaultStoreMutexGuard<'a>(MutexGuard<'a, ()>);

impl StoreKeyMutexGuardTraits for DefaultStoreMutexGuard<'_> {}

/// Default store mutex.
#[derive(Debug)]
pub struct DefaultStoreMutex(Arc<Mutex<()>>);

impl StoreKeyMutexTraits for DefaultStoreMutex {
    fn lock(&self) -> Result<StoreKeyMutexGuard<'_>, StorageError> {
        Ok(Box::new(DefaultStoreMutexGuard(self.0.lock())))
    }
}

/// Default store locks, one [`parking_lot::Mutex`] per key.
#[derive(Debug, Default)]
pub struct DefaultStoreLocks(Mutex<HashMap<StoreKey, Arc<Mutex<()>>>>);

impl DefaultStoreLocks {
    /// Create a new set of in-process locks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn key_mutex(&self, key: &StoreKey) -> Arc<Mutex<()>> {
        self.0.lock().entry(key.clone()).or_default().clone()
    }
}

impl StoreLocksTraits for DefaultStoreLocks {
    fn mutex(&self, key: &StoreKey) -> StoreKeyMutex {
        Box::new(DefaultStoreMutex(self.key_mutex(key)))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use rayon::iter::{IntoParallelIterator, ParallelIterator};

    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn store_lock_default_sync() {
        let locks = DefaultStoreLocks::new();
        let key = StoreKey::new("tensor/zarr.json").unwrap();
        let locks_held = AtomicUsize::new(0);
        assert!(!(0..20).into_par_iter().any(|_| {
            let mutex = locks.mutex(&key);
            let _lock = mutex.lock().unwrap();
            locks_held.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            let locks_held = locks_held.fetch_sub(1, Ordering::SeqCst);
            locks_held > 1
        }));
    }
}
