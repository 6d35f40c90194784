use std::collections::BTreeMap;

use crate::{
    array_subset::ArrayIndices,
    backup::{self, BackupRecord, BackupReport},
    storage::Bytes,
    tensor::{Attributes, Coordinate, LabeledArray, TensorContext, TensorError, TensorOperation},
};

use super::TensorLayout;

/// A selection of labels per dimension.
///
/// Dimensions without labels are selected in full.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection(BTreeMap<String, Vec<Coordinate>>);

impl Selection {
    /// Create an empty selection, selecting everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select `labels` along `dim`.
    #[must_use]
    pub fn with(mut self, dim: impl Into<String>, labels: Vec<Coordinate>) -> Self {
        self.0.insert(dim.into(), labels);
        self
    }

    /// Return the selected labels of `dim`, or [`None`] if the dimension is selected in full.
    #[must_use]
    pub fn labels(&self, dim: &str) -> Option<&[Coordinate]> {
        self.0.get(dim).map(Vec::as_slice)
    }

    /// Return the names of the dimensions with selected labels.
    pub fn dims(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// The lifecycle of a persisted tensor.
///
/// Every backend implements the logical operations ([`store`](TensorStorage::store),
/// [`append`](TensorStorage::append), [`update`](TensorStorage::update), [`upsert`](TensorStorage::upsert),
/// ...) and the chunk-level primitives that [`backup`](TensorStorage::backup) and
/// [`update_from_backup`](TensorStorage::update_from_backup) are built on.
///
/// Mutating operations are atomic at chunk granularity only.
/// An interrupted write may leave some touched chunks updated and others not.
pub trait TensorStorage: Send + Sync {
    /// Return the tensor identifier.
    fn tensor_id(&self) -> &str;

    /// Returns true if the tensor exists.
    ///
    /// # Errors
    /// Returns [`TensorError::Io`] if the storage cannot be queried.
    fn exists(&self) -> Result<bool, TensorError>;

    /// Return the user attributes.
    ///
    /// # Errors
    /// Returns [`TensorError::NotFound`] if the tensor does not exist.
    fn attributes(&self) -> Result<Attributes, TensorError>;

    /// Replace (`overwrite`) or merge the user attributes.
    ///
    /// # Errors
    /// Returns [`TensorError::NotFound`] if the tensor does not exist,
    /// or [`TensorError::Configuration`] if an attribute name is reserved.
    fn set_attributes(&self, attributes: Attributes, overwrite: bool) -> Result<(), TensorError>;

    /// Create the tensor from `data`, or fully replace it if `overwrite`.
    ///
    /// # Errors
    /// Returns [`TensorError::AlreadyExists`] if the tensor exists and `overwrite` is false,
    /// or [`TensorError::DimensionMismatch`] if `data` does not have the tensor dimensions.
    fn store(&self, data: LabeledArray, overwrite: bool) -> Result<(), TensorError>;

    /// Extend the tensor along `dimension` with labels strictly after the stored index.
    ///
    /// The labels of `data` along every other dimension must exist. Cells not covered by `data` are `NaN`.
    /// Appending to a tensor that does not exist stores it.
    ///
    /// # Errors
    /// Returns [`TensorError::IndexConflict`] if the labels along `dimension` do not continue the index
    /// or a label along another dimension is absent.
    fn append(&self, data: LabeledArray, dimension: &str) -> Result<(), TensorError>;

    /// Replace values in place without changing the index.
    ///
    /// # Errors
    /// Returns [`TensorError::NotFound`] if the tensor does not exist,
    /// or [`TensorError::IndexConflict`] if a label of `data` is absent.
    fn update(&self, data: LabeledArray) -> Result<(), TensorError>;

    /// Replace values in place as [`update`](TensorStorage::update), first reindexing `data` along every
    /// dimension of `complete_dims` to the stored labels.
    ///
    /// Stored labels that `data` lacks along those dimensions are overwritten with `NaN`, and labels of `data`
    /// absent from the stored index along those dimensions are ignored.
    ///
    /// # Errors
    /// Returns [`TensorError::NotFound`] if the tensor does not exist,
    /// [`TensorError::DimensionMismatch`] if a dimension of `complete_dims` is unknown,
    /// or as for [`update`](TensorStorage::update).
    fn update_complete(&self, data: LabeledArray, complete_dims: &[&str]) -> Result<(), TensorError> {
        if complete_dims.is_empty() {
            return self.update(data);
        }
        let ctx = TensorContext::new(self.tensor_id(), TensorOperation::Update);
        let layout = self.layout()?.ok_or_else(|| ctx.not_found())?;
        let mut data = data;
        for dim in complete_dims {
            let axis = layout
                .axis(dim)
                .ok_or_else(|| ctx.dimension_mismatch(format!("unknown dimension {dim}")))?;
            data = data
                .reindexed(dim, layout.coords()[axis].labels())
                .map_err(|err| ctx.dimension_mismatch(err))?;
        }
        self.update(data)
    }

    /// Update the labels of `data` that exist and insert those that do not.
    ///
    /// The index may grow with gaps. Upserting to a tensor that does not exist stores it.
    ///
    /// # Errors
    /// Returns [`TensorError::DimensionMismatch`] if `data` does not have the tensor dimensions.
    fn upsert(&self, data: LabeledArray) -> Result<(), TensorError>;

    /// Remove the labels of `selection` and rewrite the tensor without them.
    ///
    /// Dimensions without selected labels keep every label. Attributes are kept.
    ///
    /// # Errors
    /// Returns [`TensorError::NotFound`] if the tensor does not exist,
    /// [`TensorError::DimensionMismatch`] if a selected dimension is unknown,
    /// or [`TensorError::IndexConflict`] if a selected label is absent.
    fn drop_labels(&self, selection: &Selection) -> Result<(), TensorError>;

    /// Read the whole tensor.
    ///
    /// # Errors
    /// Returns [`TensorError::NotFound`] if the tensor does not exist.
    fn read(&self) -> Result<LabeledArray, TensorError> {
        self.read_selection(&Selection::new())
    }

    /// Read the labels of `selection`.
    ///
    /// # Errors
    /// Returns [`TensorError::NotFound`] if the tensor does not exist,
    /// or [`TensorError::IndexConflict`] if a selected label is absent.
    fn read_selection(&self, selection: &Selection) -> Result<LabeledArray, TensorError>;

    /// Mirror the tensor to `destination`, copying only chunks that changed since the last backup.
    ///
    /// # Errors
    /// See [`backup::backup`].
    fn backup(
        &self,
        destination: &dyn TensorStorage,
        overwrite: bool,
    ) -> Result<BackupReport, TensorError> {
        backup::backup(self, destination, overwrite)
    }

    /// Reconcile the tensor with its backup copy in `source`.
    ///
    /// # Errors
    /// See [`backup::update_from_backup`].
    fn update_from_backup(
        &self,
        source: &dyn TensorStorage,
        force_overwrite: bool,
    ) -> Result<BackupReport, TensorError> {
        backup::update_from_backup(self, source, force_overwrite)
    }

    /// Delete the tensor, and its configured backup copy unless `only_local`.
    ///
    /// Deleting a tensor that does not exist does nothing.
    ///
    /// # Errors
    /// Returns [`TensorError::Io`] if the storage fails.
    fn delete_file(&self, only_local: bool) -> Result<(), TensorError>;

    /// Release held resources. Idempotent.
    ///
    /// # Errors
    /// Returns an error if buffered writes cannot be written.
    fn close(&self) -> Result<(), TensorError>;

    /// Return the layout of the tensor and its backup record, or [`None`] if the tensor does not exist.
    ///
    /// # Errors
    /// Returns [`TensorError::InvalidMetadata`] if the stored metadata is invalid.
    fn layout_and_record(&self)
        -> Result<Option<(TensorLayout, Option<BackupRecord>)>, TensorError>;

    /// Return the layout of the tensor, or [`None`] if the tensor does not exist.
    ///
    /// # Errors
    /// Returns [`TensorError::InvalidMetadata`] if the stored metadata is invalid.
    fn layout(&self) -> Result<Option<TensorLayout>, TensorError> {
        Ok(self.layout_and_record()?.map(|(layout, _)| layout))
    }

    /// Return the backup record, if this is a backup copy.
    ///
    /// # Errors
    /// Returns [`TensorError::InvalidMetadata`] if the stored metadata is invalid.
    fn backup_record(&self) -> Result<Option<BackupRecord>, TensorError> {
        Ok(self.layout_and_record()?.and_then(|(_, record)| record))
    }

    /// Write the layout of the tensor, and the backup record if this is a backup copy.
    ///
    /// # Errors
    /// Returns [`TensorError::Io`] if the storage fails.
    fn write_layout(
        &self,
        layout: &TensorLayout,
        record: Option<&BackupRecord>,
    ) -> Result<(), TensorError>;

    /// Return the indices of every stored chunk in ascending order.
    ///
    /// # Errors
    /// Returns [`TensorError::Io`] if the storage fails.
    fn stored_chunks(&self) -> Result<Vec<ArrayIndices>, TensorError>;

    /// Return the encoded bytes of the chunk at `chunk_indices`, or [`None`] if it is not stored.
    ///
    /// # Errors
    /// Returns [`TensorError::Io`] if the storage fails.
    fn retrieve_encoded_chunk(&self, chunk_indices: &[u64]) -> Result<Option<Bytes>, TensorError>;

    /// Store the encoded bytes of the chunk at `chunk_indices`.
    ///
    /// # Errors
    /// Returns [`TensorError::Io`] if the storage fails,
    /// or [`TensorError::InvalidMetadata`] if `bytes` is not a chunk of the tensor.
    fn store_encoded_chunk(&self, chunk_indices: &[u64], bytes: Bytes) -> Result<(), TensorError>;

    /// Erase the chunk at `chunk_indices`.
    ///
    /// # Errors
    /// Returns [`TensorError::Io`] if the storage fails.
    fn erase_chunk(&self, chunk_indices: &[u64]) -> Result<(), TensorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::coordinates;

    #[test]
    fn selection() {
        let selection = Selection::new().with("time", coordinates([1, 2]));
        assert_eq!(selection.labels("time"), Some(coordinates([1, 2]).as_slice()));
        assert_eq!(selection.labels("asset"), None);
        assert_eq!(selection.dims().collect::<Vec<_>>(), vec!["time"]);
    }
}
