use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use itertools::Itertools;
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use rayon::prelude::*;

use crate::{
    array_subset::{ArrayIndices, ArraySubset},
    backup::BackupRecord,
    chunk_geometry::{chunks_for_positions, ChunkPositions, Coverage},
    storage::{
        store_lock::{DefaultStoreLocks, StoreLocks},
        Bytes, ListableStorageTraits, ReadableStorageTraits, ReadableWritableListableStorage,
        StoreKey, StorePrefix, WritableStorageTraits,
    },
    tensor::{
        Attributes, LabeledArray, TensorContext, TensorDescriptor, TensorError, TensorOperation,
    },
};

use super::{
    array_metadata::{
        chunk_key_name, decode_chunk, encode_chunk, parse_chunk_key_name, ArrayMetadata,
        CHUNK_PREFIX_NAME, METADATA_NAME, RESERVED_ATTRIBUTES,
    },
    write_plan::{
        align, plan_append, plan_drop, plan_read, plan_store, plan_update, plan_upsert, scatter,
        shape_usize, WritePlan,
    },
    Selection, TensorLayout, TensorStorage,
};

/// A tensor stored as a chunked array in a key/value store.
///
/// Writes translate logical regions into chunks. Fully covered chunks are written directly, partially
/// covered chunks are read, merged and rewritten. Chunk data is written before the metadata, so a shape
/// is only published after all of its chunks were attempted.
///
/// Writers to the same tensor, including the chunk primitives used by backup and recovery, are serialised
/// by the [`StoreLocks`] mutex of the tensor metadata key. Reads do not lock and may observe a write in progress.
pub struct ChunkedTensorStorage {
    descriptor: TensorDescriptor,
    store: ReadableWritableListableStorage,
    backup_store: Option<ReadableWritableListableStorage>,
    locks: StoreLocks,
    prefix: StorePrefix,
    chunk_prefix: StorePrefix,
    metadata_key: StoreKey,
}

impl ChunkedTensorStorage {
    /// Create a chunked tensor storage for the tensor described by `descriptor` in `store`.
    ///
    /// Writers are serialised within the process by default, see [`with_locks`](Self::with_locks).
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the tensor identifier is not a valid store prefix.
    pub fn new(
        descriptor: TensorDescriptor,
        store: ReadableWritableListableStorage,
    ) -> Result<Self, TensorError> {
        let configuration = |err: &dyn std::fmt::Display| {
            TensorError::Configuration(format!("tensor {}: {err}", descriptor.id()))
        };
        let prefix = StorePrefix::for_tensor(descriptor.id()).map_err(|err| configuration(&err))?;
        let chunk_prefix = prefix
            .child(CHUNK_PREFIX_NAME)
            .map_err(|err| configuration(&err))?;
        let metadata_key =
            StoreKey::under(&prefix, METADATA_NAME).map_err(|err| configuration(&err))?;
        Ok(Self {
            descriptor,
            store,
            backup_store: None,
            locks: Arc::new(DefaultStoreLocks::new()),
            prefix,
            chunk_prefix,
            metadata_key,
        })
    }

    /// Serialise writers with `locks`.
    #[must_use]
    pub fn with_locks(mut self, locks: StoreLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Set the store holding the backup copy of the tensor.
    #[must_use]
    pub fn with_backup_store(mut self, backup_store: ReadableWritableListableStorage) -> Self {
        self.backup_store = Some(backup_store);
        self
    }

    /// Return the tensor descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &TensorDescriptor {
        &self.descriptor
    }

    /// Return the store prefix of the tensor.
    #[must_use]
    pub fn prefix(&self) -> &StorePrefix {
        &self.prefix
    }

    /// Return the key of the tensor metadata.
    #[must_use]
    pub fn metadata_key(&self) -> &StoreKey {
        &self.metadata_key
    }

    /// Return the storage of the backup copy in the configured backup store, if any.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] as for [`ChunkedTensorStorage::new`].
    pub fn backup_copy(&self) -> Result<Option<Self>, TensorError> {
        self.backup_store
            .as_ref()
            .map(|store| {
                Ok(Self::new(self.descriptor.clone(), store.clone())?.with_locks(self.locks.clone()))
            })
            .transpose()
    }

    fn ctx(&self, operation: TensorOperation) -> TensorContext<'_> {
        TensorContext::new(self.descriptor.id(), operation)
    }

    /// Run `f` holding the writer mutex of the tensor.
    fn locked<T>(
        &self,
        ctx: TensorContext<'_>,
        f: impl FnOnce() -> Result<T, TensorError>,
    ) -> Result<T, TensorError> {
        let mutex = self.locks.mutex(&self.metadata_key);
        let _guard = mutex.lock().map_err(|err| ctx.io(err))?;
        f()
    }

    fn load(
        &self,
        ctx: TensorContext<'_>,
    ) -> Result<Option<(TensorLayout, Option<BackupRecord>)>, TensorError> {
        let Some(bytes) = self
            .store
            .get(&self.metadata_key)
            .map_err(|err| ctx.io(err))?
        else {
            return Ok(None);
        };
        let metadata: ArrayMetadata =
            serde_json::from_slice(&bytes).map_err(|err| ctx.invalid_metadata(err))?;
        let (layout, record) =
            TensorLayout::from_metadata(metadata).map_err(|err| ctx.invalid_metadata(err))?;
        if layout.dims() != self.descriptor.dims() || layout.chunks() != self.descriptor.chunks() {
            return Err(ctx.invalid_metadata(format!(
                "stored dimensions {:?} chunked {:?} do not match {:?} chunked {:?}",
                layout.dims(),
                layout.chunks(),
                self.descriptor.dims(),
                self.descriptor.chunks()
            )));
        }
        Ok(Some((layout, record)))
    }

    fn require(
        &self,
        ctx: TensorContext<'_>,
    ) -> Result<(TensorLayout, Option<BackupRecord>), TensorError> {
        self.load(ctx)?.ok_or_else(|| ctx.not_found())
    }

    fn write_metadata(
        &self,
        ctx: TensorContext<'_>,
        layout: &TensorLayout,
        record: Option<&BackupRecord>,
    ) -> Result<(), TensorError> {
        let metadata = layout
            .to_metadata(record)
            .map_err(|err| ctx.invalid_metadata(err))?;
        let bytes = serde_json::to_vec_pretty(&metadata).map_err(|err| ctx.invalid_metadata(err))?;
        self.store
            .set(&self.metadata_key, Bytes::from(bytes))
            .map_err(|err| ctx.io(err))
    }

    fn chunk_key(
        &self,
        ctx: TensorContext<'_>,
        chunk_indices: &[u64],
    ) -> Result<StoreKey, TensorError> {
        StoreKey::under(&self.prefix, &chunk_key_name(chunk_indices)).map_err(|err| ctx.io(err))
    }

    fn chunk_shape(&self) -> Vec<u64> {
        self.descriptor.chunks().to_vec()
    }

    /// Read the chunk at `chunk_indices`, `NaN` if it is not stored.
    fn read_chunk(
        &self,
        ctx: TensorContext<'_>,
        chunk_indices: &[u64],
    ) -> Result<ArrayD<f64>, TensorError> {
        let chunk_shape = self.chunk_shape();
        match self
            .store
            .get(&self.chunk_key(ctx, chunk_indices)?)
            .map_err(|err| ctx.io(err))?
        {
            Some(bytes) => decode_chunk(&bytes, &chunk_shape).map_err(|reason| {
                ctx.invalid_metadata(format!("{}: {reason}", chunk_key_name(chunk_indices)))
            }),
            None => Ok(ArrayD::from_elem(
                IxDyn(&shape_usize(&chunk_shape)),
                f64::NAN,
            )),
        }
    }

    fn write_chunk(
        &self,
        ctx: TensorContext<'_>,
        chunk_indices: &[u64],
        values: &ArrayD<f64>,
    ) -> Result<(), TensorError> {
        self.store
            .set(&self.chunk_key(ctx, chunk_indices)?, encode_chunk(values))
            .map_err(|err| ctx.io(err))
    }

    fn chunk_indices(&self, ctx: TensorContext<'_>) -> Result<Vec<ArrayIndices>, TensorError> {
        let keys = self
            .store
            .list_prefix(&self.chunk_prefix)
            .map_err(|err| ctx.io(err))?;
        let mut chunks: Vec<ArrayIndices> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(&self.prefix))
            .filter_map(parse_chunk_key_name)
            .filter(|chunk| chunk.len() == self.descriptor.dims().len())
            .collect();
        chunks.sort();
        Ok(chunks)
    }

    /// Write `values` at the per-dimension `positions` of `layout`.
    ///
    /// Cells of partially covered chunks beyond `old_shape` are reset to `NaN`.
    /// Returns the chunks written.
    fn write_cells(
        &self,
        ctx: TensorContext<'_>,
        layout: &TensorLayout,
        old_shape: Option<&[u64]>,
        positions: &[Vec<u64>],
        values: &ArrayD<f64>,
    ) -> Result<Vec<ArrayIndices>, TensorError> {
        if positions.iter().any(Vec::is_empty) {
            return Ok(vec![]);
        }
        let shape = layout.shape();
        let per_dimension = itertools::izip!(layout.chunks(), positions, &shape)
            .map(|(&chunk_size, positions, &extent)| {
                chunks_for_positions(chunk_size, positions, extent)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let writes: Vec<Vec<ChunkPositions>> =
            per_dimension.into_iter().multi_cartesian_product().collect();
        let direct = writes
            .iter()
            .filter(|chunk| chunk.iter().all(|c| c.coverage == Coverage::Full))
            .count();
        tracing::debug!(
            tensor_id = self.descriptor.id(),
            operation = %ctx.operation(),
            direct,
            read_modify_write = writes.len() - direct,
            "writing chunks"
        );

        let chunk_shape = self.chunk_shape();
        writes
            .par_iter()
            .map(|chunk| -> Result<ArrayIndices, TensorError> {
                let chunk_indices: ArrayIndices = chunk.iter().map(|c| c.chunk).collect();
                let full = chunk.iter().all(|c| c.coverage == Coverage::Full);
                let mut chunk_values = match old_shape {
                    Some(old_shape) if !full => {
                        let mut existing = self.read_chunk(ctx, &chunk_indices)?;
                        mask_beyond(&mut existing, &chunk_indices, &chunk_shape, old_shape);
                        existing
                    }
                    _ => ArrayD::from_elem(IxDyn(&shape_usize(&chunk_shape)), f64::NAN),
                };
                let mut source = vec![0usize; chunk.len()];
                let mut target = vec![0usize; chunk.len()];
                for cell in chunk
                    .iter()
                    .map(|c| c.offsets.iter().copied())
                    .multi_cartesian_product()
                {
                    for (axis, (source_index, offset)) in cell.into_iter().enumerate() {
                        source[axis] = source_index;
                        target[axis] = offset as usize;
                    }
                    chunk_values[IxDyn(&target)] = values[IxDyn(&source)];
                }
                self.write_chunk(ctx, &chunk_indices, &chunk_values)?;
                Ok(chunk_indices)
            })
            .collect()
    }

    /// Reset stored cells beyond `old_shape` in chunks that grew but were not written.
    fn mask_grown(
        &self,
        ctx: TensorContext<'_>,
        layout: &TensorLayout,
        old_shape: &[u64],
        written: &[ArrayIndices],
    ) -> Result<(), TensorError> {
        let shape = layout.shape();
        let geometry = layout.geometry()?;
        let mut grown = BTreeSet::new();
        for (axis, (&old, &new)) in std::iter::zip(old_shape, &shape).enumerate() {
            if new > old {
                let mut ranges: Vec<_> = shape.iter().map(|&extent| 0..extent).collect();
                ranges[axis] = old..new;
                grown.extend(
                    geometry.chunks_in_subset(&ArraySubset::new_with_ranges(&ranges), &shape)?,
                );
            }
        }
        for chunk in written {
            grown.remove(chunk);
        }
        let chunk_shape = self.chunk_shape();
        for chunk_indices in grown {
            let key = self.chunk_key(ctx, &chunk_indices)?;
            if self.store.contains(&key).map_err(|err| ctx.io(err))? {
                let mut existing = self.read_chunk(ctx, &chunk_indices)?;
                mask_beyond(&mut existing, &chunk_indices, &chunk_shape, old_shape);
                self.write_chunk(ctx, &chunk_indices, &existing)?;
            }
        }
        Ok(())
    }

    /// Write the whole tensor, erasing chunks outside of it, then the metadata.
    fn write_full(
        &self,
        ctx: TensorContext<'_>,
        layout: &TensorLayout,
        values: &ArrayD<f64>,
    ) -> Result<(), TensorError> {
        let positions: Vec<Vec<u64>> = layout
            .shape()
            .into_iter()
            .map(|extent| (0..extent).collect())
            .collect();
        let written: HashSet<ArrayIndices> = self
            .write_cells(ctx, layout, None, &positions, values)?
            .into_iter()
            .collect();
        for chunk_indices in self.chunk_indices(ctx)? {
            if !written.contains(&chunk_indices) {
                self.store
                    .erase(&self.chunk_key(ctx, &chunk_indices)?)
                    .map_err(|err| ctx.io(err))?;
            }
        }
        self.write_metadata(ctx, layout, None)?;
        tracing::info!(
            tensor_id = self.descriptor.id(),
            operation = %ctx.operation(),
            shape = ?layout.shape(),
            chunks = written.len(),
            "wrote tensor"
        );
        Ok(())
    }

    /// Read the values at the per-dimension `positions` of `layout`.
    fn read_positions(
        &self,
        ctx: TensorContext<'_>,
        layout: &TensorLayout,
        positions: &[Vec<u64>],
    ) -> Result<ArrayD<f64>, TensorError> {
        let shape: Vec<usize> = positions.iter().map(Vec::len).collect();
        let mut values = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
        if values.is_empty() {
            return Ok(values);
        }
        let extent = layout.shape();
        let per_dimension = itertools::izip!(layout.chunks(), positions, &extent)
            .map(|(&chunk_size, positions, &extent)| {
                chunks_for_positions(chunk_size, positions, extent)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let reads: Vec<Vec<ChunkPositions>> =
            per_dimension.into_iter().multi_cartesian_product().collect();
        let chunks = reads
            .par_iter()
            .map(|chunk| {
                let chunk_indices: ArrayIndices = chunk.iter().map(|c| c.chunk).collect();
                self.read_chunk(ctx, &chunk_indices)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut source = vec![0usize; positions.len()];
        let mut target = vec![0usize; positions.len()];
        for (chunk, chunk_values) in std::iter::zip(&reads, &chunks) {
            for cell in chunk
                .iter()
                .map(|c| c.offsets.iter().copied())
                .multi_cartesian_product()
            {
                for (axis, (target_index, offset)) in cell.into_iter().enumerate() {
                    target[axis] = target_index;
                    source[axis] = offset as usize;
                }
                values[IxDyn(&target)] = chunk_values[IxDyn(&source)];
            }
        }
        Ok(values)
    }

    /// Apply `plan` to the tensor with `layout`.
    fn apply(
        &self,
        ctx: TensorContext<'_>,
        layout: &TensorLayout,
        has_record: bool,
        plan: &WritePlan,
        values: &ArrayD<f64>,
    ) -> Result<(), TensorError> {
        if let Some(relocation) = &plan.relocation {
            tracing::warn!(
                tensor_id = self.descriptor.id(),
                "coordinate index reordered, rewriting the tensor"
            );
            let all: Vec<Vec<u64>> = layout
                .shape()
                .into_iter()
                .map(|extent| (0..extent).collect())
                .collect();
            let existing = self.read_positions(ctx, layout, &all)?;
            let mut merged = ArrayD::from_elem(
                IxDyn(&shape_usize(&plan.layout.shape())),
                f64::NAN,
            );
            scatter(&mut merged, relocation, &existing);
            scatter(&mut merged, &plan.positions, values);
            return self.write_full(ctx, &plan.layout, &merged);
        }

        let old_shape = plan.old_shape.as_deref();
        let written = self.write_cells(ctx, &plan.layout, old_shape, &plan.positions, values)?;
        if let Some(old_shape) = old_shape {
            self.mask_grown(ctx, &plan.layout, old_shape, &written)?;
        }
        if plan.changes_layout(layout) || has_record {
            self.write_metadata(ctx, &plan.layout, None)?;
            tracing::info!(
                tensor_id = self.descriptor.id(),
                operation = %ctx.operation(),
                shape = ?plan.layout.shape(),
                "tensor layout changed"
            );
        }
        Ok(())
    }

    fn store_data(
        &self,
        ctx: TensorContext<'_>,
        data: &LabeledArray,
    ) -> Result<(), TensorError> {
        let plan = plan_store(ctx, &self.descriptor, data)?;
        self.write_full(ctx, &plan.layout, data.values())
    }
}

/// Reset the cells of the chunk at `chunk_indices` beyond `array_shape` to `NaN`.
fn mask_beyond(
    chunk_values: &mut ArrayD<f64>,
    chunk_indices: &[u64],
    chunk_shape: &[u64],
    array_shape: &[u64],
) {
    for (axis, ((&chunk, &size), &extent)) in chunk_indices
        .iter()
        .zip(chunk_shape)
        .zip(array_shape)
        .enumerate()
    {
        let valid = extent.saturating_sub(chunk * size).min(size) as usize;
        chunk_values
            .slice_axis_mut(Axis(axis), Slice::from(valid..))
            .fill(f64::NAN);
    }
}

impl TensorStorage for ChunkedTensorStorage {
    fn tensor_id(&self) -> &str {
        self.descriptor.id()
    }

    fn exists(&self) -> Result<bool, TensorError> {
        self.store
            .contains(&self.metadata_key)
            .map_err(|err| self.ctx(TensorOperation::Exists).io(err))
    }

    fn attributes(&self) -> Result<Attributes, TensorError> {
        let (layout, _) = self.require(self.ctx(TensorOperation::GetAttributes))?;
        Ok(layout.attributes().clone())
    }

    fn set_attributes(&self, attributes: Attributes, overwrite: bool) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::SetAttributes);
        if let Some(name) = attributes
            .keys()
            .find(|name| RESERVED_ATTRIBUTES.contains(&name.as_str()))
        {
            return Err(TensorError::Configuration(format!(
                "attribute {name} is reserved"
            )));
        }
        self.locked(ctx, || {
            let (mut layout, record) = self.require(ctx)?;
            let attributes = if overwrite {
                attributes
            } else {
                let mut merged = layout.attributes().clone();
                merged.extend(attributes);
                merged
            };
            layout.set_attributes(attributes);
            self.write_metadata(ctx, &layout, record.as_ref())
        })
    }

    fn store(&self, data: LabeledArray, overwrite: bool) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Store);
        let data = align(ctx, data, self.descriptor.dims())?;
        self.locked(ctx, || {
            if !overwrite && self.store.contains(&self.metadata_key).map_err(|err| ctx.io(err))? {
                return Err(ctx.already_exists());
            }
            self.store_data(ctx, &data)
        })
    }

    fn append(&self, data: LabeledArray, dimension: &str) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Append);
        let data = align(ctx, data, self.descriptor.dims())?;
        self.locked(ctx, || {
            let Some((layout, record)) = self.load(ctx)? else {
                tracing::debug!(tensor_id = self.descriptor.id(), "appending to a new tensor");
                return self.store_data(ctx, &data);
            };
            if data.is_empty() {
                return Ok(());
            }
            let plan = plan_append(ctx, &layout, &data, dimension)?;
            self.apply(ctx, &layout, record.is_some(), &plan, data.values())
        })
    }

    fn update(&self, data: LabeledArray) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Update);
        let data = align(ctx, data, self.descriptor.dims())?;
        self.locked(ctx, || {
            let (layout, record) = self.require(ctx)?;
            if data.is_empty() {
                return Ok(());
            }
            let plan = plan_update(ctx, &layout, &data)?;
            self.apply(ctx, &layout, record.is_some(), &plan, data.values())
        })
    }

    fn upsert(&self, data: LabeledArray) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Upsert);
        let data = align(ctx, data, self.descriptor.dims())?;
        self.locked(ctx, || {
            let Some((layout, record)) = self.load(ctx)? else {
                return self.store_data(ctx, &data);
            };
            if data.is_empty() {
                return Ok(());
            }
            let plan = plan_upsert(ctx, &layout, &data)?;
            self.apply(ctx, &layout, record.is_some(), &plan, data.values())
        })
    }

    fn drop_labels(&self, selection: &Selection) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::DropLabels);
        self.locked(ctx, || {
            let (layout, _) = self.require(ctx)?;
            let (new_layout, kept) = plan_drop(ctx, &layout, selection)?;
            if new_layout.coords() == layout.coords() {
                return Ok(());
            }
            let values = self.read_positions(ctx, &layout, &kept)?;
            self.write_full(ctx, &new_layout, &values)
        })
    }

    fn read_selection(&self, selection: &Selection) -> Result<LabeledArray, TensorError> {
        let ctx = self.ctx(TensorOperation::Read);
        let (layout, _) = self.require(ctx)?;
        let positions = plan_read(ctx, &layout, selection)?;
        let values = self.read_positions(ctx, &layout, &positions)?;
        let coords = std::iter::zip(layout.coords(), &positions)
            .map(|(index, positions)| {
                positions
                    .iter()
                    .map(|&position| index.labels()[position as usize].clone())
                    .collect()
            })
            .collect();
        LabeledArray::new(layout.dims().to_vec(), coords, values)
            .map_err(|err| ctx.dimension_mismatch(err))
    }

    fn delete_file(&self, only_local: bool) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Delete);
        self.locked(ctx, || {
            self.store
                .erase_prefix(&self.prefix)
                .map_err(|err| ctx.io(err))?;
            if !only_local {
                if let Some(backup_store) = &self.backup_store {
                    backup_store
                        .erase_prefix(&self.prefix)
                        .map_err(|err| ctx.io(err))?;
                }
            }
            tracing::info!(tensor_id = self.descriptor.id(), only_local, "deleted tensor");
            Ok(())
        })
    }

    fn close(&self) -> Result<(), TensorError> {
        tracing::debug!(tensor_id = self.descriptor.id(), "closed");
        Ok(())
    }

    fn layout_and_record(
        &self,
    ) -> Result<Option<(TensorLayout, Option<BackupRecord>)>, TensorError> {
        self.load(self.ctx(TensorOperation::Chunk))
    }

    fn write_layout(
        &self,
        layout: &TensorLayout,
        record: Option<&BackupRecord>,
    ) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Chunk);
        if layout.dims() != self.descriptor.dims() || layout.chunks() != self.descriptor.chunks() {
            return Err(ctx.dimension_mismatch(format!(
                "layout dimensions {:?} do not match {:?}",
                layout.dims(),
                self.descriptor.dims()
            )));
        }
        self.locked(ctx, || self.write_metadata(ctx, layout, record))
    }

    fn stored_chunks(&self) -> Result<Vec<ArrayIndices>, TensorError> {
        self.chunk_indices(self.ctx(TensorOperation::Chunk))
    }

    fn retrieve_encoded_chunk(&self, chunk_indices: &[u64]) -> Result<Option<Bytes>, TensorError> {
        let ctx = self.ctx(TensorOperation::Chunk);
        self.store
            .get(&self.chunk_key(ctx, chunk_indices)?)
            .map_err(|err| ctx.io(err))
    }

    fn store_encoded_chunk(&self, chunk_indices: &[u64], bytes: Bytes) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Chunk);
        let expected = self.descriptor.chunks().iter().product::<u64>()
            * std::mem::size_of::<f64>() as u64;
        if bytes.len() as u64 != expected {
            return Err(ctx.invalid_metadata(format!(
                "chunk {} has {} bytes, expected {expected}",
                chunk_key_name(chunk_indices),
                bytes.len()
            )));
        }
        let key = self.chunk_key(ctx, chunk_indices)?;
        self.locked(ctx, || self.store.set(&key, bytes).map_err(|err| ctx.io(err)))
    }

    fn erase_chunk(&self, chunk_indices: &[u64]) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Chunk);
        let key = self.chunk_key(ctx, chunk_indices)?;
        self.locked(ctx, || self.store.erase(&key).map_err(|err| ctx.io(err)))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::{
        storage::store::MemoryStore,
        tensor::{coordinates, Coordinate},
    };

    fn descriptor() -> TensorDescriptor {
        TensorDescriptor::new(
            "prices",
            vec!["time".to_string(), "asset".to_string()],
            vec![4, 2],
        )
        .unwrap()
    }

    fn data(times: impl IntoIterator<Item = i64>, assets: &[&str], offset: f64) -> LabeledArray {
        let times = coordinates(times);
        let len = times.len() * assets.len();
        LabeledArray::from_shape_vec(
            &["time", "asset"],
            vec![times, coordinates(assets.iter().copied())],
            (0..len).map(|i| offset + i as f64).collect(),
        )
        .unwrap()
    }

    fn tensor() -> (Arc<MemoryStore>, ChunkedTensorStorage) {
        let store = Arc::new(MemoryStore::new());
        let tensor = ChunkedTensorStorage::new(descriptor(), store.clone()).unwrap();
        (store, tensor)
    }

    #[test]
    fn chunked_store_read() -> Result<(), Box<dyn Error>> {
        let (store, tensor) = tensor();
        assert!(!tensor.exists()?);
        let stored = data(0..10, &["a", "b", "c"], 0.0);
        tensor.store(stored.clone(), false)?;
        assert!(tensor.exists()?);
        assert!(tensor.read()?.equals(&stored));
        assert_eq!(tensor.stored_chunks()?.len(), 3 * 2);
        assert!(store.get(&"prices/zarr.json".try_into()?)?.is_some());
        assert!(store.get(&"prices/c/2/1".try_into()?)?.is_some());

        assert!(matches!(
            tensor.store(stored.clone(), false),
            Err(TensorError::AlreadyExists { .. })
        ));
        tensor.store(data(0..2, &["a"], 100.0), true)?;
        assert_eq!(tensor.read()?.shape(), &[2, 1]);
        assert_eq!(tensor.stored_chunks()?, vec![vec![0, 0]]);
        Ok(())
    }

    #[test]
    fn chunked_store_transposed_unsorted() -> Result<(), Box<dyn Error>> {
        let (_, tensor) = tensor();
        let data = LabeledArray::from_shape_vec(
            &["asset", "time"],
            vec![coordinates(["b", "a"]), coordinates([1, 0])],
            vec![1.0, 2.0, 3.0, 4.0],
        )?;
        tensor.store(data, false)?;
        let read = tensor.read()?;
        assert_eq!(read.dims(), &["time", "asset"]);
        assert_eq!(read.get(&[Coordinate::Int(0), "a".into()]), Some(4.0));
        assert_eq!(read.get(&[Coordinate::Int(1), "b".into()]), Some(1.0));
        Ok(())
    }

    #[test]
    fn chunked_append() -> Result<(), Box<dyn Error>> {
        let (_, tensor) = tensor();
        tensor.append(data(0..10, &["a", "b"], 0.0), "time")?;
        tensor.append(data([10], &["b"], 50.0), "time")?;
        let read = tensor.read()?;
        assert_eq!(read.shape(), &[11, 2]);
        assert_eq!(read.get(&[Coordinate::Int(10), "b".into()]), Some(50.0));
        assert!(read.get(&[Coordinate::Int(10), "a".into()]).unwrap().is_nan());
        assert_eq!(read.get(&[Coordinate::Int(9), "b".into()]), Some(19.0));

        let err = tensor.append(data([12], &["a"], 0.0), "time").unwrap_err();
        assert!(matches!(
            err,
            TensorError::IndexConflict { coordinate: Coordinate::Int(12), .. }
        ));
        assert_eq!(tensor.read()?.shape(), &[11, 2]);
        Ok(())
    }

    #[test]
    fn chunked_append_masks_stale_cells() -> Result<(), Box<dyn Error>> {
        let (store, tensor) = tensor();
        tensor.store(data(0..2, &["a", "b"], 0.0), false)?;
        // an interrupted write left values beyond the stored extent
        let stale = ArrayD::from_elem(IxDyn(&[4, 2]), 7.0);
        store.set(&"prices/c/0/0".try_into()?, encode_chunk(&stale))?;
        tensor.append(data([2], &["a"], 9.0), "time")?;
        let read = tensor.read()?;
        assert_eq!(read.get(&[Coordinate::Int(2), "a".into()]), Some(9.0));
        assert!(read.get(&[Coordinate::Int(2), "b".into()]).unwrap().is_nan());
        Ok(())
    }

    #[test]
    fn chunked_update() -> Result<(), Box<dyn Error>> {
        let (_, tensor) = tensor();
        assert!(matches!(
            tensor.update(data([3], &["a"], 0.0)),
            Err(TensorError::NotFound { .. })
        ));
        tensor.store(data(0..10, &["a", "b"], 0.0), false)?;
        tensor.update(data([3, 4], &["b"], -1.0))?;
        let read = tensor.read()?;
        assert_eq!(read.get(&[Coordinate::Int(3), "b".into()]), Some(-1.0));
        assert_eq!(read.get(&[Coordinate::Int(4), "b".into()]), Some(0.0));
        assert_eq!(read.get(&[Coordinate::Int(3), "a".into()]), Some(6.0));
        assert!(matches!(
            tensor.update(data([20], &["a"], 0.0)),
            Err(TensorError::IndexConflict { .. })
        ));
        Ok(())
    }

    #[test]
    fn chunked_upsert() -> Result<(), Box<dyn Error>> {
        let (_, tensor) = tensor();
        tensor.store(data(0..10, &["a"], 0.0), false)?;
        tensor.upsert(data([3, 20], &["a"], 100.0))?;
        let read = tensor.read()?;
        assert_eq!(read.shape(), &[11, 1]);
        assert_eq!(read.get(&[Coordinate::Int(3), "a".into()]), Some(100.0));
        assert_eq!(read.get(&[Coordinate::Int(20), "a".into()]), Some(101.0));

        // inserting inside the index reorders and rewrites
        tensor.upsert(data([5], &["0"], -5.0))?;
        let read = tensor.read()?;
        assert_eq!(read.shape(), &[11, 2]);
        assert_eq!(read.coords()[1], coordinates(["0", "a"]));
        assert_eq!(read.get(&[Coordinate::Int(5), "0".into()]), Some(-5.0));
        assert!(read.get(&[Coordinate::Int(6), "0".into()]).unwrap().is_nan());
        assert_eq!(read.get(&[Coordinate::Int(20), "a".into()]), Some(101.0));
        Ok(())
    }

    #[test]
    fn chunked_read_selection() -> Result<(), Box<dyn Error>> {
        let (_, tensor) = tensor();
        tensor.store(data(0..10, &["a", "b", "c"], 0.0), false)?;
        let selection = Selection::new()
            .with("time", coordinates([9, 1]))
            .with("asset", coordinates(["c"]));
        let read = tensor.read_selection(&selection)?;
        assert_eq!(read.shape(), &[2, 1]);
        assert_eq!(read.get(&[Coordinate::Int(9), "c".into()]), Some(29.0));
        assert_eq!(read.get(&[Coordinate::Int(1), "c".into()]), Some(5.0));
        let selection = Selection::new().with("time", coordinates([10]));
        assert!(matches!(
            tensor.read_selection(&selection),
            Err(TensorError::IndexConflict { .. })
        ));
        Ok(())
    }

    #[test]
    fn chunked_attributes() -> Result<(), Box<dyn Error>> {
        let (_, tensor) = tensor();
        assert!(matches!(
            tensor.attributes(),
            Err(TensorError::NotFound { .. })
        ));
        tensor.store(data(0..1, &["a"], 0.0), false)?;
        let mut attributes = Attributes::new();
        attributes.insert("units".to_string(), "USD".into());
        tensor.set_attributes(attributes.clone(), false)?;
        let mut more = Attributes::new();
        more.insert("source".to_string(), "feed".into());
        tensor.set_attributes(more.clone(), false)?;
        assert_eq!(tensor.attributes()?.len(), 2);
        tensor.set_attributes(more, true)?;
        assert_eq!(tensor.attributes()?.len(), 1);
        assert!(tensor.attributes()?.contains_key("source"));

        let mut reserved = Attributes::new();
        reserved.insert("_tensordb_coordinates".to_string(), 1.into());
        assert!(matches!(
            tensor.set_attributes(reserved, false),
            Err(TensorError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn chunked_delete() -> Result<(), Box<dyn Error>> {
        let backup = Arc::new(MemoryStore::new());
        let (store, tensor) = tensor();
        let tensor = tensor.with_backup_store(backup.clone());
        tensor.store(data(0..4, &["a"], 0.0), false)?;
        tensor.backup_copy()?.unwrap().store(data(0..4, &["a"], 0.0), false)?;
        tensor.delete_file(true)?;
        assert!(!tensor.exists()?);
        assert!(store.is_empty());
        assert!(!backup.is_empty());
        tensor.delete_file(false)?;
        assert!(backup.is_empty());
        Ok(())
    }

    #[test]
    fn chunked_encoded_chunks() -> Result<(), Box<dyn Error>> {
        let (_, tensor) = tensor();
        tensor.store(data(0..5, &["a"], 0.0), false)?;
        assert_eq!(tensor.stored_chunks()?, vec![vec![0, 0], vec![1, 0]]);
        let bytes = tensor.retrieve_encoded_chunk(&[1, 0])?.unwrap();
        assert_eq!(bytes.len(), 4 * 2 * 8);
        tensor.erase_chunk(&[1, 0])?;
        assert!(tensor
            .read()?
            .get(&[Coordinate::Int(4), "a".into()])
            .unwrap()
            .is_nan());
        tensor.store_encoded_chunk(&[1, 0], bytes)?;
        assert_eq!(
            tensor.read()?.get(&[Coordinate::Int(4), "a".into()]),
            Some(4.0)
        );
        assert!(matches!(
            tensor.store_encoded_chunk(&[1, 0], Bytes::from_static(&[0; 3])),
            Err(TensorError::InvalidMetadata { .. })
        ));
        Ok(())
    }

    #[test]
    fn chunked_encoded_chunks_wait_for_writers() -> Result<(), Box<dyn Error>> {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let locks: StoreLocks = Arc::new(DefaultStoreLocks::new());
        let (_, tensor) = tensor();
        let tensor = tensor.with_locks(locks.clone());
        tensor.store(data(0..5, &["a"], 0.0), false)?;
        let bytes = tensor.retrieve_encoded_chunk(&[0, 0])?.unwrap();

        let done = AtomicUsize::new(0);
        let mutex = locks.mutex(tensor.metadata_key());
        std::thread::scope(|scope| -> Result<(), Box<dyn Error>> {
            let guard = mutex.lock()?;
            scope.spawn(|| {
                tensor.store_encoded_chunk(&[0, 0], bytes).unwrap();
                done.fetch_add(1, Ordering::SeqCst);
                tensor.erase_chunk(&[1, 0]).unwrap();
                done.fetch_add(1, Ordering::SeqCst);
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert_eq!(done.load(Ordering::SeqCst), 0);
            drop(guard);
            Ok(())
        })?;
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(tensor.stored_chunks()?, vec![vec![0, 0]]);
        Ok(())
    }

    #[test]
    fn chunked_concurrent_appends() -> Result<(), Box<dyn Error>> {
        let (_, tensor) = tensor();
        tensor.store(data(0..1, &["a"], 0.0), false)?;
        (0..8).into_par_iter().for_each(|_| {
            // each writer appends the next label, losing the race is a conflict
            loop {
                let next = tensor.read().unwrap().len_of("time").unwrap() as i64;
                match tensor.append(data([next], &["a"], next as f64), "time") {
                    Ok(()) => break,
                    Err(TensorError::IndexConflict { .. }) => continue,
                    Err(err) => panic!("{err}"),
                }
            }
        });
        let read = tensor.read()?;
        assert_eq!(read.shape(), &[9, 1]);
        for time in 0..9 {
            assert_eq!(read.get(&[Coordinate::Int(time), "a".into()]), Some(time as f64));
        }
        Ok(())
    }
}
