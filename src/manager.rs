//! The tensor storage manager.
//!
//! A [`TensorStorageManager`] owns the stores of a deployment and the [`TensorDefinition`] of every tensor.
//! It builds a [`ChunkedTensorStorage`] per tensor with the lock primitive of the tensor's [`Synchronizer`],
//! keeps a bounded set of open [`CachedTensor`] handles, and dispatches operations by name through an
//! [`OperationRegistry`].
//!
//! ```rust
//! # use std::{num::NonZeroUsize, sync::Arc};
//! # use tensordb::manager::{OperationArgs, TensorDefinition, TensorStorageManager};
//! # use tensordb::storage::store::MemoryStore;
//! # use tensordb::tensor::{coordinates, LabeledArray};
//! let manager = TensorStorageManager::new(
//!     Arc::new(MemoryStore::new()),
//!     Some(Arc::new(MemoryStore::new())),
//!     NonZeroUsize::new(4).unwrap(),
//! );
//! manager.add_definition(
//!     "prices",
//!     TensorDefinition::new(vec!["time".to_string()], vec![16]).with_cache("time", 8),
//! )?;
//! let data = LabeledArray::from_shape_vec(&["time"], vec![coordinates([0, 1])], vec![1.0, 2.0])?;
//! manager.call("prices", "append", OperationArgs::with_data(data))?;
//! manager.backup("prices", false)?;
//! # Ok::<_, Box<dyn std::error::Error>>(())
//! ```

mod operations;
mod tensor_definition;

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::Path,
    sync::Arc,
};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

pub use operations::{OperationArgs, OperationHandler, OperationOutput, OperationRegistry};
pub use tensor_definition::{CacheDefinition, Synchronizer, TensorDefinition};

use crate::{
    backend::{ChunkedTensorStorage, TensorStorage},
    backup::BackupReport,
    cached_tensor::CachedTensor,
    storage::{
        store_lock::{DefaultStoreLocks, DisabledStoreLocks, FileStoreLocks, StoreLocks},
        ReadableWritableListableStorage,
    },
    tensor::TensorError,
};

/// Manages the tensors of a local store and its optional backup store.
pub struct TensorStorageManager {
    local: ReadableWritableListableStorage,
    backup: Option<ReadableWritableListableStorage>,
    definitions: RwLock<HashMap<String, TensorDefinition>>,
    thread_locks: StoreLocks,
    process_locks: Option<StoreLocks>,
    handles: Mutex<LruCache<String, Arc<CachedTensor>>>,
    operations: OperationRegistry,
}

impl std::fmt::Debug for TensorStorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorStorageManager")
            .field("tensors", &self.definitions.read().len())
            .field("open_handles", &self.handles.lock().len())
            .field("backup", &self.backup.is_some())
            .finish_non_exhaustive()
    }
}

impl TensorStorageManager {
    /// Create a manager of the tensors in `local`, backed up to `backup`, with at most `max_open_handles`
    /// open cached handles.
    #[must_use]
    pub fn new(
        local: ReadableWritableListableStorage,
        backup: Option<ReadableWritableListableStorage>,
        max_open_handles: NonZeroUsize,
    ) -> Self {
        Self {
            local,
            backup,
            definitions: RwLock::new(HashMap::new()),
            thread_locks: Arc::new(DefaultStoreLocks::new()),
            process_locks: None,
            handles: Mutex::new(LruCache::new(max_open_handles)),
            operations: OperationRegistry::new(),
        }
    }

    /// Serialise writers of tensors with the [`Synchronizer::Process`] synchronizer through lock files in `directory`.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the directory cannot be created.
    pub fn with_lock_directory<P: AsRef<Path>>(mut self, directory: P) -> Result<Self, TensorError> {
        let locks = FileStoreLocks::new(directory)
            .map_err(|err| TensorError::Configuration(err.to_string()))?;
        self.process_locks = Some(Arc::new(locks));
        Ok(self)
    }

    /// Return the operation registry.
    #[must_use]
    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    /// Return the operation registry for registering further operations.
    pub fn operations_mut(&mut self) -> &mut OperationRegistry {
        &mut self.operations
    }

    /// Validate and register the definition of the tensor `tensor_id`, replacing any prior definition.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the definition is invalid.
    pub fn add_definition(
        &self,
        tensor_id: &str,
        definition: TensorDefinition,
    ) -> Result<(), TensorError> {
        definition.validate(tensor_id)?;
        tracing::debug!(tensor_id, "registered tensor definition");
        self.definitions
            .write()
            .insert(tensor_id.to_string(), definition);
        Ok(())
    }

    /// Return the definition of the tensor `tensor_id`.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the tensor has no definition.
    pub fn definition(&self, tensor_id: &str) -> Result<TensorDefinition, TensorError> {
        self.definitions
            .read()
            .get(tensor_id)
            .cloned()
            .ok_or_else(|| TensorError::Configuration(format!("tensor {tensor_id} is not defined")))
    }

    /// Return the identifiers of every defined tensor in ascending order.
    #[must_use]
    pub fn tensor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn locks(&self, tensor_id: &str, synchronizer: Synchronizer) -> Result<StoreLocks, TensorError> {
        match synchronizer {
            Synchronizer::None => Ok(Arc::new(DisabledStoreLocks)),
            Synchronizer::Thread => Ok(self.thread_locks.clone()),
            Synchronizer::Process => self.process_locks.clone().ok_or_else(|| {
                TensorError::Configuration(format!(
                    "tensor {tensor_id} synchronizes processes but the manager has no lock directory"
                ))
            }),
        }
    }

    /// Return the storage of the tensor `tensor_id`.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the tensor has no definition or needs a lock directory.
    pub fn storage(&self, tensor_id: &str) -> Result<ChunkedTensorStorage, TensorError> {
        let definition = self.definition(tensor_id)?;
        let locks = self.locks(tensor_id, definition.synchronizer())?;
        let storage = ChunkedTensorStorage::new(definition.descriptor(tensor_id)?, self.local.clone())?
            .with_locks(locks);
        Ok(match &self.backup {
            Some(backup) => storage.with_backup_store(backup.clone()),
            None => storage,
        })
    }

    /// Return the storage of the backup copy of the tensor `tensor_id`.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the manager has no backup store or the tensor has no definition.
    pub fn backup_storage(&self, tensor_id: &str) -> Result<ChunkedTensorStorage, TensorError> {
        self.storage(tensor_id)?.backup_copy()?.ok_or_else(|| {
            TensorError::Configuration(format!(
                "tensor {tensor_id} cannot be backed up without a backup store"
            ))
        })
    }

    /// Return the open cached handle of the tensor `tensor_id`, opening it if necessary.
    ///
    /// Opening a handle when `max_open_handles` are open flushes and closes the least recently used one.
    /// If that handle cannot be closed it stays open with its buffered writes, and no handle is opened.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the tensor has no definition or no cache definition,
    /// or the close error of the least recently used handle.
    pub fn cached(&self, tensor_id: &str) -> Result<Arc<CachedTensor>, TensorError> {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(tensor_id) {
            return Ok(handle.clone());
        }
        let cache = self.definition(tensor_id)?.cache.ok_or_else(|| {
            TensorError::Configuration(format!("tensor {tensor_id} has no cache definition"))
        })?;
        let handle = Arc::new(CachedTensor::new(
            Arc::new(self.storage(tensor_id)?),
            cache.dimension,
            cache.max_cached_extent,
        )?);
        if handles.len() == handles.cap().get() {
            if let Some((evicted_id, evicted)) = handles.peek_lru() {
                tracing::info!(tensor_id = evicted_id, "evicting cached handle");
                if let Err(err) = evicted.close() {
                    tracing::warn!(
                        tensor_id = evicted_id,
                        error = %err,
                        "failed to close evicted cached handle, keeping it open"
                    );
                    return Err(err);
                }
            }
            handles.pop_lru();
        }
        handles.put(tensor_id.to_string(), handle.clone());
        tracing::debug!(tensor_id, "opened cached handle");
        Ok(handle)
    }

    /// Return the handle operations on the tensor `tensor_id` go through.
    ///
    /// This is the cached handle if the tensor has a cache definition, otherwise its storage.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the tensor has no definition.
    pub fn handle(&self, tensor_id: &str) -> Result<Arc<dyn TensorStorage>, TensorError> {
        let handle: Arc<dyn TensorStorage> = if self.definition(tensor_id)?.cache.is_some() {
            self.cached(tensor_id)?
        } else {
            Arc::new(self.storage(tensor_id)?)
        };
        Ok(handle)
    }

    /// Return the number of open cached handles.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// Mirror the tensor `tensor_id` to the backup store.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if there is no backup store, otherwise see [`crate::backup::backup`].
    pub fn backup(&self, tensor_id: &str, overwrite: bool) -> Result<BackupReport, TensorError> {
        let destination = self.backup_storage(tensor_id)?;
        self.handle(tensor_id)?.backup(&destination, overwrite)
    }

    /// Reconcile the tensor `tensor_id` from the backup store.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if there is no backup store, otherwise see [`crate::backup::update_from_backup`].
    pub fn update_from_backup(
        &self,
        tensor_id: &str,
        force_overwrite: bool,
    ) -> Result<BackupReport, TensorError> {
        let source = self.backup_storage(tensor_id)?;
        self.handle(tensor_id)?
            .update_from_backup(&source, force_overwrite)
    }

    /// Call the operation `name` on the tensor `tensor_id`.
    ///
    /// # Errors
    /// See [`OperationRegistry::call`].
    pub fn call(
        &self,
        tensor_id: &str,
        name: &str,
        args: OperationArgs,
    ) -> Result<OperationOutput, TensorError> {
        self.operations.call(self, tensor_id, name, args)
    }

    /// Flush every open cached handle.
    ///
    /// # Errors
    /// Returns the first flush error after attempting every handle.
    pub fn flush_all(&self) -> Result<(), TensorError> {
        let handles: Vec<Arc<CachedTensor>> =
            self.handles.lock().iter().map(|(_, handle)| handle.clone()).collect();
        let mut result = Ok(());
        for handle in handles {
            if let Err(err) = handle.flush() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Flush and close the cached handle of the tensor `tensor_id`, if open.
    ///
    /// # Errors
    /// Returns the flush error, keeping the handle open.
    pub fn close(&self, tensor_id: &str) -> Result<(), TensorError> {
        let handle = self.handles.lock().get(tensor_id).cloned();
        if let Some(handle) = handle {
            handle.close()?;
            self.handles.lock().pop(tensor_id);
            tracing::debug!(tensor_id, "closed cached handle");
        }
        Ok(())
    }

    /// Flush and close every cached handle.
    ///
    /// # Errors
    /// Returns the first close error after attempting every handle. Handles that failed stay open.
    pub fn close_all(&self) -> Result<(), TensorError> {
        let mut result = Ok(());
        for tensor_id in self.open_tensor_ids() {
            if let Err(err) = self.close(&tensor_id) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn open_tensor_ids(&self) -> Vec<String> {
        self.handles
            .lock()
            .iter()
            .map(|(tensor_id, _)| tensor_id.clone())
            .collect()
    }
}

impl Drop for TensorStorageManager {
    fn drop(&mut self) {
        if let Err(err) = self.close_all() {
            tracing::warn!(error = %err, "failed to close cached handles");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::{
        backend::Selection,
        storage::store::MemoryStore,
        tensor::{coordinates, Coordinate, LabeledArray},
    };

    fn manager(max_open_handles: usize) -> TensorStorageManager {
        TensorStorageManager::new(
            Arc::new(MemoryStore::new()),
            Some(Arc::new(MemoryStore::new())),
            NonZeroUsize::new(max_open_handles).unwrap(),
        )
    }

    fn definition() -> TensorDefinition {
        TensorDefinition::new(vec!["time".to_string()], vec![4]).with_cache("time", 3)
    }

    fn data(times: impl IntoIterator<Item = i64>) -> LabeledArray {
        let times = coordinates(times);
        let values = times
            .iter()
            .map(|time| match time {
                Coordinate::Int(time) => *time as f64,
                Coordinate::Str(_) => f64::NAN,
            })
            .collect();
        LabeledArray::from_shape_vec(&["time"], vec![times], values).unwrap()
    }

    #[test]
    fn manager_definitions() {
        let manager = manager(2);
        assert!(matches!(
            manager.storage("prices"),
            Err(TensorError::Configuration(_))
        ));
        assert!(manager
            .add_definition("prices", TensorDefinition::new(vec![], vec![]))
            .is_err());
        manager.add_definition("prices", definition()).unwrap();
        manager
            .add_definition("volumes", TensorDefinition::new(vec!["time".to_string()], vec![4]))
            .unwrap();
        assert_eq!(manager.tensor_ids(), vec!["prices", "volumes"]);
        assert!(matches!(
            manager.cached("volumes"),
            Err(TensorError::Configuration(_))
        ));
        assert!(matches!(
            manager.call("prices", "compact", OperationArgs::default()),
            Err(TensorError::Configuration(_))
        ));
    }

    #[test]
    fn manager_process_synchronizer() -> Result<(), Box<dyn Error>> {
        let manager = manager(2);
        manager.add_definition(
            "prices",
            definition().with_synchronizer(Synchronizer::Process),
        )?;
        assert!(matches!(
            manager.storage("prices"),
            Err(TensorError::Configuration(_))
        ));
        let directory = tempfile::TempDir::new()?;
        let manager = manager.with_lock_directory(directory.path())?;
        manager.call("prices", "store", OperationArgs::with_data(data(0..2)))?;
        assert!(matches!(
            manager.call("prices", "exists", OperationArgs::default())?,
            OperationOutput::Exists(true)
        ));
        Ok(())
    }

    #[test]
    fn manager_cached_handles() -> Result<(), Box<dyn Error>> {
        let manager = manager(1);
        manager.add_definition("prices", definition())?;
        manager.add_definition("volumes", definition())?;

        manager.call("prices", "append", OperationArgs::with_data(data(0..2)))?;
        assert_eq!(manager.cached("prices")?.cached_extent(), 2);
        assert!(!manager.storage("prices")?.exists()?);

        // opening a second handle evicts and flushes the first
        manager.call("volumes", "append", OperationArgs::with_data(data([0])))?;
        assert_eq!(manager.open_handles(), 1);
        assert_eq!(manager.storage("prices")?.read()?.len_of("time"), Some(2));

        manager.flush_all()?;
        assert_eq!(manager.storage("volumes")?.read()?.len_of("time"), Some(1));
        manager.close_all()?;
        assert_eq!(manager.open_handles(), 0);
        Ok(())
    }

    #[test]
    fn manager_eviction_keeps_unflushed_handle() -> Result<(), Box<dyn Error>> {
        let manager = manager(1);
        manager.add_definition("prices", definition())?;
        manager.add_definition("volumes", definition())?;

        // the update cannot be flushed while the tensor does not exist
        manager.call("prices", "update", OperationArgs::with_data(data([0])))?;
        assert!(matches!(
            manager.cached("volumes"),
            Err(TensorError::NotFound { .. })
        ));
        assert_eq!(manager.open_handles(), 1);
        assert_eq!(manager.cached("prices")?.cached_extent(), 1);

        let stored =
            LabeledArray::from_shape_vec(&["time"], vec![coordinates(0..2)], vec![-1.0, -1.0])?;
        manager.storage("prices")?.store(stored, false)?;
        manager.cached("volumes")?;
        assert_eq!(manager.open_handles(), 1);
        let read = manager.storage("prices")?.read()?;
        assert_eq!(read.get(&[Coordinate::Int(0)]), Some(0.0));
        assert_eq!(read.get(&[Coordinate::Int(1)]), Some(-1.0));
        Ok(())
    }

    #[test]
    fn manager_operations() -> Result<(), Box<dyn Error>> {
        let mut manager = manager(2);
        manager.add_definition("prices", definition())?;
        manager.call("prices", "store", OperationArgs::with_data(data(0..4)))?;
        manager.call(
            "prices",
            "append",
            OperationArgs::with_data(data([4])).dimension("time"),
        )?;
        let OperationOutput::Data(read) =
            manager.call("prices", "read", OperationArgs::default())?
        else {
            panic!("read returns data");
        };
        assert_eq!(read.len_of("time"), Some(5));

        let mut attributes = crate::tensor::Attributes::new();
        attributes.insert("units".to_string(), "USD".into());
        manager.call(
            "prices",
            "set_attributes",
            OperationArgs {
                attributes,
                ..OperationArgs::default()
            },
        )?;
        let OperationOutput::Attributes(attributes) =
            manager.call("prices", "get_attributes", OperationArgs::default())?
        else {
            panic!("get_attributes returns attributes");
        };
        assert_eq!(attributes["units"], "USD");

        let OperationOutput::Report(report) =
            manager.call("prices", "backup", OperationArgs::default())?
        else {
            panic!("backup returns a report");
        };
        assert_eq!(report.chunks_copied, 2);
        assert!(manager.backup_storage("prices")?.backup_record()?.is_some());

        manager.call(
            "prices",
            "delete_file",
            OperationArgs {
                only_local: true,
                ..OperationArgs::default()
            },
        )?;
        assert!(!manager.storage("prices")?.exists()?);
        let report = manager.update_from_backup("prices", false)?;
        assert_eq!(report.chunks_copied, 2);
        assert!(manager.storage("prices")?.read()?.equals(&read));

        manager.call(
            "prices",
            "drop",
            OperationArgs {
                selection: Selection::new().with("time", coordinates([4])),
                ..OperationArgs::default()
            },
        )?;
        manager.call(
            "prices",
            "update",
            OperationArgs::with_data(data([1, 9])).complete_dims(["time"]),
        )?;
        let read = manager.handle("prices")?.read()?;
        assert_eq!(read.labels("time"), Some(coordinates(0..4).as_slice()));
        assert_eq!(read.get(&[Coordinate::Int(1)]), Some(1.0));
        assert!(read.get(&[Coordinate::Int(3)]).is_some_and(f64::is_nan));

        manager
            .operations_mut()
            .register("count", |manager, tensor_id, _| {
                let read = manager.handle(tensor_id)?.read()?;
                Ok(OperationOutput::Exists(!read.is_empty()))
            });
        assert!(manager.operations().contains("count"));
        manager.call("prices", "count", OperationArgs::default())?;
        manager.call("prices", "close", OperationArgs::default())?;
        Ok(())
    }
}
