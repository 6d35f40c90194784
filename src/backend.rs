//! Tensor storage backends.
//!
//! [`TensorStorage`] is the lifecycle every backend implements: existence, attributes, the logical writes
//! (`store`, `append`, `update`, `upsert`, `drop_labels`), reads, backup and recovery, and deletion.
//!
//! - [`ChunkedTensorStorage`] stores a tensor as a Zarr V3 array of chunks in a key/value store, and
//! - [`MemoryTensorStorage`] holds a tensor in memory.
//!
//! Cells without a value read as `NaN`, including cells of labels inserted by [`TensorStorage::upsert`]
//! that were never written.

mod array_metadata;
mod chunked_backend;
mod memory_backend;
mod tensor_storage;
mod write_plan;

pub use array_metadata::{
    chunk_key_name, decode_chunk, encode_chunk, parse_chunk_key_name, ArrayMetadata, MetadataV3,
    TensorLayout, BACKUP_RECORD_ATTRIBUTE, COORDINATES_ATTRIBUTE, RESERVED_ATTRIBUTES,
    STEPS_ATTRIBUTE,
};
pub use chunked_backend::ChunkedTensorStorage;
pub use memory_backend::MemoryTensorStorage;
pub use tensor_storage::{Selection, TensorStorage};
