//! A filesystem store.
//!
//! Each key maps to a file relative to the base path. Writes go to a sibling temporary file
//! which is then renamed over the target, so a reader never observes a partially written value.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use walkdir::WalkDir;

use crate::storage::{
    Bytes, ListableStorageTraits, MaybeBytes, ReadableStorageTraits, StorageError, StoreKey,
    StoreKeyError, StoreKeys, StoreKeysPrefixes, StorePrefix, StorePrefixes,
    WritableStorageTraits,
};

const TEMPORARY_SUFFIX: &str = ".partial";

/// A synchronous file system store.
#[derive(Debug)]
pub struct FilesystemStore {
    base_path: PathBuf,
    readonly: bool,
    files: Mutex<HashMap<StoreKey, Arc<RwLock<()>>>>,
}

impl FilesystemStore {
    /// Create a new file system store at a given `base_path`.
    ///
    /// The directory is created if it does not exist.
    ///
    /// # Errors
    /// Returns a [`FilesystemStoreCreateError`] if `base_path`:
    ///   - is not valid,
    ///   - points to an existing file rather than a directory, or
    ///   - cannot be created.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, FilesystemStoreCreateError> {
        let base_path = base_path.as_ref().to_path_buf();
        if base_path.to_str().is_none() {
            return Err(FilesystemStoreCreateError::InvalidBasePath(base_path));
        }

        let readonly = if base_path.exists() {
            let md = std::fs::metadata(&base_path)?;
            if !md.is_dir() {
                return Err(FilesystemStoreCreateError::InvalidBasePath(base_path));
            }
            md.permissions().readonly()
        } else {
            std::fs::create_dir_all(&base_path)?;
            false
        };

        Ok(Self {
            base_path,
            readonly,
            files: Mutex::default(),
        })
    }

    /// Returns the base path of the store.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Maps a [`StoreKey`] to a filesystem [`PathBuf`].
    #[must_use]
    pub fn key_to_fspath(&self, key: &StoreKey) -> PathBuf {
        self.base_path.join(key.as_str())
    }

    /// Maps a store [`StorePrefix`] to a filesystem [`PathBuf`].
    #[must_use]
    pub fn prefix_to_fs_path(&self, prefix: &StorePrefix) -> PathBuf {
        self.base_path.join(prefix.as_str())
    }

    fn fspath_to_key(&self, path: &Path) -> Result<StoreKey, StoreKeyError> {
        let relative = pathdiff::diff_paths(path, &self.base_path)
            .ok_or_else(|| StoreKeyError::from(path.to_string_lossy().to_string()))?;
        let components: Vec<_> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect();
        StoreKey::new(components.join("/"))
    }

    fn get_file_mutex(&self, key: &StoreKey) -> Arc<RwLock<()>> {
        self.files.lock().entry(key.clone()).or_default().clone()
    }

    fn is_temporary(path: &Path) -> bool {
        path.to_str()
            .is_some_and(|path| path.ends_with(TEMPORARY_SUFFIX))
    }

    /// List the keys of the files under `root`.
    ///
    /// A missing `root` and entries removed during the walk are skipped, any other walk error is returned.
    fn walk_keys(&self, root: PathBuf) -> Result<StoreKeys, StorageError> {
        let mut keys = StoreKeys::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err)
                    if err
                        .io_error()
                        .is_some_and(|err| err.kind() == std::io::ErrorKind::NotFound) =>
                {
                    continue;
                }
                Err(err) => return Err(std::io::Error::from(err).into()),
            };
            if !entry.file_type().is_file() || Self::is_temporary(entry.path()) {
                continue;
            }
            if let Ok(key) = self.fspath_to_key(entry.path()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

impl ReadableStorageTraits for FilesystemStore {
    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        let file = self.get_file_mutex(key);
        let _lock = file.read();

        let mut file = match File::open(self.key_to_fspath(key)) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Ok(Some(Bytes::from(buffer)))
    }

    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        match std::fs::metadata(self.key_to_fspath(key)) {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl WritableStorageTraits for FilesystemStore {
    fn set(&self, key: &StoreKey, value: Bytes) -> Result<(), StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }

        let file = self.get_file_mutex(key);
        let _lock = file.write();

        let key_path = self.key_to_fspath(key);
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut temporary_path = key_path.clone().into_os_string();
        temporary_path.push(TEMPORARY_SUFFIX);
        let temporary_path = PathBuf::from(temporary_path);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temporary_path)?;
            file.write_all(&value)?;
            file.sync_data()?;
        }
        std::fs::rename(&temporary_path, &key_path)?;
        Ok(())
    }

    fn erase(&self, key: &StoreKey) -> Result<(), StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }

        let file = self.get_file_mutex(key);
        let _lock = file.write();

        match std::fs::remove_file(self.key_to_fspath(key)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn erase_prefix(&self, prefix: &StorePrefix) -> Result<(), StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }

        let _lock = self.files.lock(); // lock all operations

        let prefix_path = self.prefix_to_fs_path(prefix);
        let result = if prefix.as_str().is_empty() {
            // keep the base directory itself
            std::fs::read_dir(&prefix_path).and_then(|entries| {
                entries.into_iter().try_for_each(|entry| {
                    let path = entry?.path();
                    if path.is_dir() {
                        std::fs::remove_dir_all(path)
                    } else {
                        std::fs::remove_file(path)
                    }
                })
            })
        } else {
            std::fs::remove_dir_all(prefix_path)
        };
        match result {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

impl ListableStorageTraits for FilesystemStore {
    fn list(&self) -> Result<StoreKeys, StorageError> {
        self.walk_keys(self.base_path.clone())
    }

    fn list_prefix(&self, prefix: &StorePrefix) -> Result<StoreKeys, StorageError> {
        self.walk_keys(self.prefix_to_fs_path(prefix))
    }

    fn list_dir(&self, prefix: &StorePrefix) -> Result<StoreKeysPrefixes, StorageError> {
        let mut keys: StoreKeys = vec![];
        let mut prefixes: StorePrefixes = vec![];
        if let Ok(dir) = std::fs::read_dir(self.prefix_to_fs_path(prefix)) {
            for entry in dir {
                let entry = entry?;
                let fs_path = entry.path();
                if Self::is_temporary(&fs_path) {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if entry.file_type()?.is_dir() {
                    prefixes.push(prefix.child(name)?);
                } else {
                    keys.push(StoreKey::under(prefix, name)?);
                }
            }
        }
        keys.sort();
        prefixes.sort();
        Ok(StoreKeysPrefixes::new(keys, prefixes))
    }

    fn size_prefix(&self, prefix: &StorePrefix) -> Result<u64, StorageError> {
        let mut size = 0;
        for key in self.list_prefix(prefix)? {
            if let Some(size_key) = self.size_key(&key)? {
                size += size_key;
            }
        }
        Ok(size)
    }
}

/// A filesystem store creation error.
#[derive(Debug, Error)]
pub enum FilesystemStoreCreateError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The path is not valid on this system.
    #[error("base path {0} is not valid")]
    InvalidBasePath(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn filesystem() -> Result<(), Box<dyn Error>> {
        let path = tempfile::TempDir::new()?;
        let store = FilesystemStore::new(path.path())?;
        super::super::test_util::store_write(&store)?;
        super::super::test_util::store_read(&store)?;
        super::super::test_util::store_list(&store)?;
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn filesystem_no_partial_files() -> Result<(), Box<dyn Error>> {
        let path = tempfile::TempDir::new()?;
        let store = FilesystemStore::new(path.path())?;
        let key: StoreKey = "t/c/0/0".try_into()?;
        store.set(&key, Bytes::from_static(&[1, 2, 3]))?;
        store.set(&key, Bytes::from_static(&[4]))?;
        assert_eq!(store.get(&key)?, Some(Bytes::from_static(&[4])));
        assert_eq!(store.list()?, vec![key]);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    #[cfg_attr(miri, ignore)]
    fn filesystem_list_unreadable_directory() -> Result<(), Box<dyn Error>> {
        use std::os::unix::fs::PermissionsExt;

        let path = tempfile::TempDir::new()?;
        let store = FilesystemStore::new(path.path())?;
        store.set(&"t/c/0".try_into()?, Bytes::from_static(&[0]))?;
        store.set(&"t/c/1/0".try_into()?, Bytes::from_static(&[1]))?;
        let prefix: StorePrefix = "t/c/".try_into()?;
        assert_eq!(store.list_prefix(&prefix)?.len(), 2);
        assert!(store.list_prefix(&"missing/".try_into()?)?.is_empty());

        let unreadable = path.path().join("t/c/1");
        std::fs::set_permissions(&unreadable, std::fs::Permissions::from_mode(0o000))?;
        let readable = std::fs::read_dir(&unreadable).is_ok();
        let listed = store.list_prefix(&prefix);
        std::fs::set_permissions(&unreadable, std::fs::Permissions::from_mode(0o755))?;
        // permission bits do not restrict a privileged user
        if !readable {
            assert!(matches!(listed, Err(StorageError::IOError(_))));
        }
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn filesystem_base_path_is_file() -> Result<(), Box<dyn Error>> {
        let file = tempfile::NamedTempFile::new()?;
        assert!(matches!(
            FilesystemStore::new(file.path()),
            Err(FilesystemStoreCreateError::InvalidBasePath(_))
        ));
        Ok(())
    }
}
