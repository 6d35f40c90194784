//! Cross-process store locks backed by advisory lock files.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
};

use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};

use crate::storage::{StorageError, StoreKey};

use super::{
    DefaultStoreLocks, StoreKeyMutex, StoreKeyMutexGuard, StoreKeyMutexGuardTraits,
    StoreKeyMutexTraits, StoreLocksTraits,
};

const LOCK_SUFFIX: &str = ".lock";

/// File store mutex guard.
///
/// Holds the in-process mutex and an exclusive lock on the key's lock file. Both are released on drop.
#[derive(Debug)]
pub struct FileStoreMutexGuard<'a> {
    file: File,
    _thread: MutexGuard<'a, ()>,
}

impl Drop for FileStoreMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!("failed to release lock file: {err}");
        }
    }
}

impl StoreKeyMutexGuardTraits for FileStoreMutexGuard<'_> {}

/// File store mutex.
#[derive(Debug)]
pub struct FileStoreMutex {
    key: StoreKey,
    path: PathBuf,
    thread: Arc<Mutex<()>>,
}

impl StoreKeyMutexTraits for FileStoreMutex {
    fn lock(&self) -> Result<StoreKeyMutexGuard<'_>, StorageError> {
        // advisory locks are per file handle, the thread mutex keeps handles in this process from racing
        let thread = self.thread.lock();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|err| StorageError::Lock(self.key.clone(), err.to_string()))?;
        file.lock_exclusive()
            .map_err(|err| StorageError::Lock(self.key.clone(), err.to_string()))?;
        Ok(Box::new(FileStoreMutexGuard {
            file,
            _thread: thread,
        }))
    }
}

/// Store locks that serialise writers across processes sharing `directory`.
#[derive(Debug)]
pub struct FileStoreLocks {
    directory: PathBuf,
    threads: DefaultStoreLocks,
}

impl FileStoreLocks {
    /// Create file locks in `directory`, creating it if necessary.
    ///
    /// # Errors
    /// Returns [`StorageError::MissingLockDirectory`] if the directory cannot be created.
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self, StorageError> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)
            .map_err(|_| StorageError::MissingLockDirectory(directory.clone()))?;
        Ok(Self {
            directory,
            threads: DefaultStoreLocks::new(),
        })
    }

    /// Returns the lock directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Map `key` to a flat lock file name, escaping `%` and `/` so distinct keys never share a file.
    fn lock_path(&self, key: &StoreKey) -> PathBuf {
        let mut name = String::with_capacity(key.as_str().len() + LOCK_SUFFIX.len());
        for c in key.as_str().chars() {
            match c {
                '%' => name.push_str("%25"),
                '/' => name.push_str("%2F"),
                c => name.push(c),
            }
        }
        name.push_str(LOCK_SUFFIX);
        self.directory.join(name)
    }
}

impl StoreLocksTraits for FileStoreLocks {
    fn mutex(&self, key: &StoreKey) -> StoreKeyMutex {
        Box::new(FileStoreMutex {
            key: key.clone(),
            path: self.lock_path(key),
            thread: self.threads.key_mutex(key),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn store_lock_file() -> Result<(), Box<dyn Error>> {
        let directory = tempfile::TempDir::new()?;
        let locks = FileStoreLocks::new(directory.path().join("locks"))?;
        let key = StoreKey::new("tensor/zarr.json")?;
        let locks_held = AtomicUsize::new(0);
        let max_held = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mutex = locks.mutex(&key);
                    let _lock = mutex.lock().unwrap();
                    let held = locks_held.fetch_add(1, Ordering::SeqCst) + 1;
                    max_held.fetch_max(held, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    locks_held.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert_eq!(max_held.load(Ordering::SeqCst), 1);
        assert!(locks
            .directory()
            .join("tensor%2Fzarr.json.lock")
            .exists());
        Ok(())
    }

    #[test]
    fn store_lock_file_names_distinct() -> Result<(), Box<dyn Error>> {
        let directory = tempfile::TempDir::new()?;
        let locks = FileStoreLocks::new(directory.path())?;
        let keys = [
            StoreKey::new("a__b/zarr.json")?,
            StoreKey::new("a/b/zarr.json")?,
            StoreKey::new("a%2Fb/zarr.json")?,
        ];
        let paths: std::collections::HashSet<PathBuf> =
            keys.iter().map(|key| locks.lock_path(key)).collect();
        assert_eq!(paths.len(), keys.len());
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn store_lock_file_released_on_drop() -> Result<(), Box<dyn Error>> {
        let directory = tempfile::TempDir::new()?;
        let locks = FileStoreLocks::new(directory.path())?;
        let key = StoreKey::new("tensor/zarr.json")?;
        {
            let mutex = locks.mutex(&key);
            let _guard = mutex.lock()?;
        }
        let file = File::open(locks.lock_path(&key))?;
        file.try_lock_exclusive()?;
        FileExt::unlock(&file)?;
        Ok(())
    }
}
