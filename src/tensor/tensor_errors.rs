use derive_more::Display;
use thiserror::Error;

use crate::{chunk_geometry::ChunkGeometryError, storage::StorageError};

use super::Coordinate;

/// The operation a [`TensorError`] occurred in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum TensorOperation {
    /// Checking existence.
    #[display("exists")]
    Exists,
    /// Creating or replacing a tensor.
    #[display("store")]
    Store,
    /// Appending along a dimension.
    #[display("append")]
    Append,
    /// Replacing values in place.
    #[display("update")]
    Update,
    /// Inserting or replacing values.
    #[display("upsert")]
    Upsert,
    /// Removing labels.
    #[display("drop")]
    DropLabels,
    /// Reading values.
    #[display("read")]
    Read,
    /// Reading attributes.
    #[display("get_attributes")]
    GetAttributes,
    /// Writing attributes.
    #[display("set_attributes")]
    SetAttributes,
    /// Mirroring to a backup.
    #[display("backup")]
    Backup,
    /// Reconciling from a backup.
    #[display("update_from_backup")]
    UpdateFromBackup,
    /// Deleting a tensor.
    #[display("delete_file")]
    Delete,
    /// Flushing buffered writes.
    #[display("flush")]
    Flush,
    /// Accessing chunks directly.
    #[display("chunk")]
    Chunk,
}

/// A tensor storage error.
///
/// Every variant other than [`TensorError::Configuration`] names the tensor and the operation that failed.
#[derive(Debug, Error)]
pub enum TensorError {
    /// The tensor (or its backup) does not exist.
    #[error("tensor {tensor_id} not found ({operation})")]
    NotFound {
        /// The tensor identifier.
        tensor_id: String,
        /// The failed operation.
        operation: TensorOperation,
    },
    /// The tensor (or its backup) already exists and overwriting was not requested.
    #[error("tensor {tensor_id} already exists ({operation})")]
    AlreadyExists {
        /// The tensor identifier.
        tensor_id: String,
        /// The failed operation.
        operation: TensorOperation,
    },
    /// A coordinate is not contiguous with, or absent from, the stored index.
    #[error("coordinate {coordinate} of dimension {dimension} conflicts with the index of tensor {tensor_id} ({operation})")]
    IndexConflict {
        /// The tensor identifier.
        tensor_id: String,
        /// The failed operation.
        operation: TensorOperation,
        /// The dimension of the offending coordinate.
        dimension: String,
        /// The offending coordinate.
        coordinate: Coordinate,
    },
    /// The dimensions or shape of data do not match the tensor.
    #[error("dimension mismatch for tensor {tensor_id} ({operation}): {reason}")]
    DimensionMismatch {
        /// The tensor identifier.
        tensor_id: String,
        /// The failed operation.
        operation: TensorOperation,
        /// What did not match.
        reason: String,
    },
    /// Invalid configuration, e.g. a non-positive chunk size or cache extent.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// An underlying storage failure.
    #[error("storage failure for tensor {tensor_id} ({operation})")]
    Io {
        /// The tensor identifier.
        tensor_id: String,
        /// The failed operation.
        operation: TensorOperation,
        /// The storage error.
        #[source]
        source: StorageError,
    },
    /// Stored metadata could not be parsed or is inconsistent.
    #[error("invalid metadata for tensor {tensor_id} ({operation}): {reason}")]
    InvalidMetadata {
        /// The tensor identifier.
        tensor_id: String,
        /// The failed operation.
        operation: TensorOperation,
        /// What was invalid.
        reason: String,
    },
    /// A chunk does not match its recorded checksum.
    #[error("checksum mismatch for chunk {chunk} of tensor {tensor_id} ({operation})")]
    ChecksumMismatch {
        /// The tensor identifier.
        tensor_id: String,
        /// The failed operation.
        operation: TensorOperation,
        /// The chunk key.
        chunk: String,
    },
    /// There is nothing to recover from.
    #[error("cannot recover tensor {tensor_id} ({operation}): {reason}")]
    Recovery {
        /// The tensor identifier.
        tensor_id: String,
        /// The failed operation.
        operation: TensorOperation,
        /// Why recovery is impossible.
        reason: String,
    },
}

impl TensorError {
    /// Return the operation that failed, if known.
    #[must_use]
    pub fn operation(&self) -> Option<TensorOperation> {
        match self {
            Self::Configuration(_) => None,
            Self::NotFound { operation, .. }
            | Self::AlreadyExists { operation, .. }
            | Self::IndexConflict { operation, .. }
            | Self::DimensionMismatch { operation, .. }
            | Self::Io { operation, .. }
            | Self::InvalidMetadata { operation, .. }
            | Self::ChecksumMismatch { operation, .. }
            | Self::Recovery { operation, .. } => Some(*operation),
        }
    }

    /// Return the identifier of the tensor the error refers to, if known.
    #[must_use]
    pub fn tensor_id(&self) -> Option<&str> {
        match self {
            Self::Configuration(_) => None,
            Self::NotFound { tensor_id, .. }
            | Self::AlreadyExists { tensor_id, .. }
            | Self::IndexConflict { tensor_id, .. }
            | Self::DimensionMismatch { tensor_id, .. }
            | Self::Io { tensor_id, .. }
            | Self::InvalidMetadata { tensor_id, .. }
            | Self::ChecksumMismatch { tensor_id, .. }
            | Self::Recovery { tensor_id, .. } => Some(tensor_id),
        }
    }
}

impl From<ChunkGeometryError> for TensorError {
    fn from(err: ChunkGeometryError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// The tensor and operation that errors raised during an operation refer to.
#[derive(Copy, Clone, Debug)]
pub struct TensorContext<'a> {
    tensor_id: &'a str,
    operation: TensorOperation,
}

impl<'a> TensorContext<'a> {
    /// Create a new context.
    #[must_use]
    pub const fn new(tensor_id: &'a str, operation: TensorOperation) -> Self {
        Self {
            tensor_id,
            operation,
        }
    }

    /// Return the tensor identifier.
    #[must_use]
    pub const fn tensor_id(&self) -> &'a str {
        self.tensor_id
    }

    /// Return the operation.
    #[must_use]
    pub const fn operation(&self) -> TensorOperation {
        self.operation
    }

    /// A [`TensorError::NotFound`].
    #[must_use]
    pub fn not_found(&self) -> TensorError {
        TensorError::NotFound {
            tensor_id: self.tensor_id.to_string(),
            operation: self.operation,
        }
    }

    /// A [`TensorError::AlreadyExists`].
    #[must_use]
    pub fn already_exists(&self) -> TensorError {
        TensorError::AlreadyExists {
            tensor_id: self.tensor_id.to_string(),
            operation: self.operation,
        }
    }

    /// A [`TensorError::IndexConflict`].
    #[must_use]
    pub fn index_conflict(&self, dimension: &str, coordinate: Coordinate) -> TensorError {
        TensorError::IndexConflict {
            tensor_id: self.tensor_id.to_string(),
            operation: self.operation,
            dimension: dimension.to_string(),
            coordinate,
        }
    }

    /// A [`TensorError::DimensionMismatch`].
    #[must_use]
    pub fn dimension_mismatch(&self, reason: impl ToString) -> TensorError {
        TensorError::DimensionMismatch {
            tensor_id: self.tensor_id.to_string(),
            operation: self.operation,
            reason: reason.to_string(),
        }
    }

    /// A [`TensorError::Io`].
    #[must_use]
    pub fn io(&self, source: impl Into<StorageError>) -> TensorError {
        TensorError::Io {
            tensor_id: self.tensor_id.to_string(),
            operation: self.operation,
            source: source.into(),
        }
    }

    /// A [`TensorError::InvalidMetadata`].
    #[must_use]
    pub fn invalid_metadata(&self, reason: impl ToString) -> TensorError {
        TensorError::InvalidMetadata {
            tensor_id: self.tensor_id.to_string(),
            operation: self.operation,
            reason: reason.to_string(),
        }
    }

    /// A [`TensorError::ChecksumMismatch`].
    #[must_use]
    pub fn checksum_mismatch(&self, chunk: impl ToString) -> TensorError {
        TensorError::ChecksumMismatch {
            tensor_id: self.tensor_id.to_string(),
            operation: self.operation,
            chunk: chunk.to_string(),
        }
    }

    /// A [`TensorError::Recovery`].
    #[must_use]
    pub fn recovery(&self, reason: impl ToString) -> TensorError {
        TensorError::Recovery {
            tensor_id: self.tensor_id.to_string(),
            operation: self.operation,
            reason: reason.to_string(),
        }
    }
}
