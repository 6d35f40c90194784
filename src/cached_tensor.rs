//! Write coalescing.
//!
//! A [`CachedTensor`] buffers many small sequential writes along one dimension of a tensor, e.g. one write
//! per time step, and issues them to the underlying [`TensorStorage`] as one aligned write.
//!
//! A write is buffered if it continues the buffer: it has the same [`WriteKind`], identical labels along every
//! other dimension, and its first label along the caching dimension sorts after the last buffered label.
//! Otherwise the buffer is flushed first, so per-tensor write order is preserved without explicit flushes.
//! The buffer never holds more than `max_cached_extent` labels along the caching dimension once a write returns.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    array_subset::ArrayIndices,
    backend::{Selection, TensorLayout, TensorStorage},
    backup::{BackupRecord, BackupReport},
    storage::Bytes,
    tensor::{Attributes, Coordinate, LabeledArray, TensorContext, TensorError, TensorOperation},
};

/// The logical write a buffered write is flushed as.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// Flushed with [`TensorStorage::append`] along the caching dimension.
    Append,
    /// Flushed with [`TensorStorage::update`].
    Update,
}

#[derive(Debug, Default)]
struct WriteBuffer {
    kind: Option<WriteKind>,
    writes: Vec<LabeledArray>,
    extent: usize,
    flushes: usize,
}

impl WriteBuffer {
    fn clear(&mut self) {
        self.kind = None;
        self.writes.clear();
        self.extent = 0;
    }
}

/// A tensor handle that coalesces sequential writes along one dimension.
///
/// Every other [`TensorStorage`] operation flushes the buffer first and then delegates to the wrapped storage.
/// A failed flush leaves the buffer intact so that it can be retried with [`flush`](CachedTensor::flush).
///
/// The handle assumes a single logical writer. Concurrent writers are serialised but their interleaving
/// decides what is contiguous.
pub struct CachedTensor {
    storage: Arc<dyn TensorStorage>,
    dimension: String,
    max_cached_extent: usize,
    buffer: Mutex<WriteBuffer>,
}

impl std::fmt::Debug for CachedTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedTensor")
            .field("tensor_id", &self.storage.tensor_id())
            .field("dimension", &self.dimension)
            .field("max_cached_extent", &self.max_cached_extent)
            .finish_non_exhaustive()
    }
}

impl CachedTensor {
    /// Create a handle buffering writes to `storage` along `dimension`.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if `dimension` is empty or `max_cached_extent` is zero.
    pub fn new(
        storage: Arc<dyn TensorStorage>,
        dimension: impl Into<String>,
        max_cached_extent: usize,
    ) -> Result<Self, TensorError> {
        let dimension = dimension.into();
        if dimension.is_empty() {
            return Err(TensorError::Configuration(format!(
                "the caching dimension of tensor {} must not be empty",
                storage.tensor_id()
            )));
        }
        if max_cached_extent == 0 {
            return Err(TensorError::Configuration(format!(
                "the maximum cached extent of tensor {} must be positive",
                storage.tensor_id()
            )));
        }
        Ok(Self {
            storage,
            dimension,
            max_cached_extent,
            buffer: Mutex::new(WriteBuffer::default()),
        })
    }

    /// Return the wrapped storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn TensorStorage> {
        &self.storage
    }

    /// Return the caching dimension.
    #[must_use]
    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    /// Return the maximum number of labels buffered along the caching dimension.
    #[must_use]
    pub fn max_cached_extent(&self) -> usize {
        self.max_cached_extent
    }

    /// Return the number of labels currently buffered along the caching dimension.
    #[must_use]
    pub fn cached_extent(&self) -> usize {
        self.buffer.lock().extent
    }

    /// Return the number of flushes written to the wrapped storage.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.buffer.lock().flushes
    }

    /// Buffer `data` to be written as `kind`.
    ///
    /// The buffer is flushed first if `data` does not continue it or would overflow it, and flushed after
    /// buffering `data` if it is full. A write wider than `max_cached_extent` is passed straight through.
    ///
    /// An error means `data` was not accepted: it is neither written nor buffered, so the same write can be
    /// retried. Writes accepted earlier stay buffered.
    ///
    /// # Errors
    /// Returns [`TensorError::DimensionMismatch`] if `data` lacks the caching dimension.
    /// Returns the error of a flush, of the prior contents or of the buffer filled by `data`.
    pub fn write(&self, kind: WriteKind, data: LabeledArray) -> Result<(), TensorError> {
        let ctx = TensorContext::new(self.storage.tensor_id(), operation(kind));
        let extent = data.len_of(&self.dimension).ok_or_else(|| {
            ctx.dimension_mismatch(format!("data has no dimension {}", self.dimension))
        })?;
        if extent == 0 {
            return Ok(());
        }
        let data = data.sorted();

        let mut buffer = self.buffer.lock();
        if !buffer.writes.is_empty()
            && (!self.continues(&buffer, kind, &data)
                || buffer.extent + extent > self.max_cached_extent)
        {
            self.flush_buffer(&mut buffer)?;
        }
        if extent > self.max_cached_extent {
            tracing::debug!(
                tensor_id = self.storage.tensor_id(),
                extent,
                "write exceeds the cache, writing through"
            );
            return self.delegate(kind, data);
        }

        buffer.kind = Some(kind);
        buffer.writes.push(data);
        buffer.extent += extent;
        tracing::debug!(
            tensor_id = self.storage.tensor_id(),
            extent = buffer.extent,
            "buffered write"
        );
        if buffer.extent == self.max_cached_extent {
            if let Err(err) = self.flush_buffer(&mut buffer) {
                buffer.writes.pop();
                buffer.extent -= extent;
                if buffer.writes.is_empty() {
                    buffer.kind = None;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Write all buffered writes to the wrapped storage as one write. Does nothing if the buffer is empty.
    ///
    /// # Errors
    /// Returns the error of the wrapped storage, keeping the buffer.
    pub fn flush(&self) -> Result<(), TensorError> {
        let mut buffer = self.buffer.lock();
        self.flush_buffer(&mut buffer)
    }

    /// Discard buffered writes without writing them.
    pub fn discard(&self) {
        let mut buffer = self.buffer.lock();
        if !buffer.writes.is_empty() {
            tracing::debug!(
                tensor_id = self.storage.tensor_id(),
                extent = buffer.extent,
                "discarding buffered writes"
            );
        }
        buffer.clear();
    }

    fn continues(&self, buffer: &WriteBuffer, kind: WriteKind, data: &LabeledArray) -> bool {
        let Some(last) = buffer.writes.last() else {
            return true;
        };
        if buffer.kind != Some(kind) || last.dims().len() != data.dims().len() {
            return false;
        }
        let same_labels = last
            .dims()
            .iter()
            .filter(|dim| **dim != self.dimension)
            .all(|dim| last.labels(dim).is_some() && last.labels(dim) == data.labels(dim));
        let after = match (
            last.labels(&self.dimension).and_then(<[Coordinate]>::last),
            data.labels(&self.dimension).and_then(<[Coordinate]>::first),
        ) {
            (Some(last), Some(first)) => first > last,
            _ => false,
        };
        same_labels && after
    }

    fn flush_buffer(&self, buffer: &mut WriteBuffer) -> Result<(), TensorError> {
        let Some(kind) = buffer.kind else {
            return Ok(());
        };
        if buffer.writes.is_empty() {
            return Ok(());
        }
        let ctx = TensorContext::new(self.storage.tensor_id(), TensorOperation::Flush);
        let merged = merge(ctx, &self.dimension, &buffer.writes)?;
        match self.delegate(kind, merged) {
            Ok(()) => {
                tracing::debug!(
                    tensor_id = self.storage.tensor_id(),
                    writes = buffer.writes.len(),
                    extent = buffer.extent,
                    "flushed buffered writes"
                );
                buffer.clear();
                buffer.flushes += 1;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    tensor_id = self.storage.tensor_id(),
                    extent = buffer.extent,
                    error = %err,
                    "flush failed, keeping buffered writes"
                );
                Err(err)
            }
        }
    }

    fn delegate(&self, kind: WriteKind, data: LabeledArray) -> Result<(), TensorError> {
        match kind {
            WriteKind::Append => self.storage.append(data, &self.dimension),
            WriteKind::Update => self.storage.update(data),
        }
    }
}

fn operation(kind: WriteKind) -> TensorOperation {
    match kind {
        WriteKind::Append => TensorOperation::Append,
        WriteKind::Update => TensorOperation::Update,
    }
}

/// Concatenate buffered writes along `dimension` in the dimension order of the first.
fn merge(
    ctx: TensorContext<'_>,
    dimension: &str,
    writes: &[LabeledArray],
) -> Result<LabeledArray, TensorError> {
    match writes {
        [single] => Ok(single.clone()),
        [first, ..] => {
            let dims = first.dims().to_vec();
            let aligned = writes
                .iter()
                .map(|write| write.clone().transposed(&dims))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| ctx.dimension_mismatch(err))?;
            LabeledArray::concatenate(dimension, &aligned).map_err(|err| ctx.dimension_mismatch(err))
        }
        [] => Err(ctx.dimension_mismatch("nothing to flush")),
    }
}

impl Drop for CachedTensor {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!(
                tensor_id = self.storage.tensor_id(),
                error = %err,
                "buffered writes lost on drop"
            );
        }
    }
}

impl TensorStorage for CachedTensor {
    fn tensor_id(&self) -> &str {
        self.storage.tensor_id()
    }

    fn exists(&self) -> Result<bool, TensorError> {
        self.flush()?;
        self.storage.exists()
    }

    fn attributes(&self) -> Result<Attributes, TensorError> {
        self.flush()?;
        self.storage.attributes()
    }

    fn set_attributes(&self, attributes: Attributes, overwrite: bool) -> Result<(), TensorError> {
        self.flush()?;
        self.storage.set_attributes(attributes, overwrite)
    }

    fn store(&self, data: LabeledArray, overwrite: bool) -> Result<(), TensorError> {
        self.flush()?;
        self.storage.store(data, overwrite)
    }

    fn append(&self, data: LabeledArray, dimension: &str) -> Result<(), TensorError> {
        if dimension == self.dimension {
            self.write(WriteKind::Append, data)
        } else {
            self.flush()?;
            self.storage.append(data, dimension)
        }
    }

    fn update(&self, data: LabeledArray) -> Result<(), TensorError> {
        self.write(WriteKind::Update, data)
    }

    fn upsert(&self, data: LabeledArray) -> Result<(), TensorError> {
        self.flush()?;
        self.storage.upsert(data)
    }

    fn drop_labels(&self, selection: &Selection) -> Result<(), TensorError> {
        self.flush()?;
        self.storage.drop_labels(selection)
    }

    fn read_selection(&self, selection: &Selection) -> Result<LabeledArray, TensorError> {
        self.flush()?;
        self.storage.read_selection(selection)
    }

    fn backup(
        &self,
        destination: &dyn TensorStorage,
        overwrite: bool,
    ) -> Result<BackupReport, TensorError> {
        self.flush()?;
        self.storage.backup(destination, overwrite)
    }

    fn update_from_backup(
        &self,
        source: &dyn TensorStorage,
        force_overwrite: bool,
    ) -> Result<BackupReport, TensorError> {
        self.flush()?;
        self.storage.update_from_backup(source, force_overwrite)
    }

    fn delete_file(&self, only_local: bool) -> Result<(), TensorError> {
        self.discard();
        self.storage.delete_file(only_local)
    }

    fn close(&self) -> Result<(), TensorError> {
        self.flush()?;
        self.storage.close()
    }

    fn layout_and_record(
        &self,
    ) -> Result<Option<(TensorLayout, Option<BackupRecord>)>, TensorError> {
        self.flush()?;
        self.storage.layout_and_record()
    }

    fn write_layout(
        &self,
        layout: &TensorLayout,
        record: Option<&BackupRecord>,
    ) -> Result<(), TensorError> {
        self.flush()?;
        self.storage.write_layout(layout, record)
    }

    fn stored_chunks(&self) -> Result<Vec<ArrayIndices>, TensorError> {
        self.flush()?;
        self.storage.stored_chunks()
    }

    fn retrieve_encoded_chunk(&self, chunk_indices: &[u64]) -> Result<Option<Bytes>, TensorError> {
        self.flush()?;
        self.storage.retrieve_encoded_chunk(chunk_indices)
    }

    fn store_encoded_chunk(&self, chunk_indices: &[u64], bytes: Bytes) -> Result<(), TensorError> {
        self.flush()?;
        self.storage.store_encoded_chunk(chunk_indices, bytes)
    }

    fn erase_chunk(&self, chunk_indices: &[u64]) -> Result<(), TensorError> {
        self.flush()?;
        self.storage.erase_chunk(chunk_indices)
    }
}
