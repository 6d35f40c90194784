use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    array_subset::ArrayIndices,
    backend::{chunk_key_name, parse_chunk_key_name, TensorLayout},
    tensor::CoordinateIndex,
};

/// The synchronisation state of a backup copy.
///
/// Persisted in the attributes of the backup copy. Lists the checksum of every chunk known to match
/// the primary as of the last backup run, so a later run only copies chunks whose checksum changed.
///
/// A record is complete only once a backup run finished. Checkpoints of a run in progress or of a failed
/// run are incomplete: they list the chunks actually held by the copy, not a mirror of the primary.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    tensor_id: String,
    checksums: BTreeMap<String, u32>,
    #[serde(default)]
    coordinates: BTreeMap<String, CoordinateIndex>,
    #[serde(default)]
    complete: bool,
    timestamp_ms: u64,
}

impl BackupRecord {
    /// Create an empty backup record of `tensor_id`.
    #[must_use]
    pub fn new(tensor_id: impl Into<String>) -> Self {
        Self {
            tensor_id: tensor_id.into(),
            ..Self::default()
        }
    }

    /// Return the identifier of the primary tensor.
    #[must_use]
    pub fn tensor_id(&self) -> &str {
        &self.tensor_id
    }

    /// Return the checksum of every synchronised chunk by chunk key name.
    #[must_use]
    pub fn checksums(&self) -> &BTreeMap<String, u32> {
        &self.checksums
    }

    /// Return the checksum of the chunk at `chunk_indices`.
    #[must_use]
    pub fn checksum(&self, chunk_indices: &[u64]) -> Option<u32> {
        self.checksums.get(&chunk_key_name(chunk_indices)).copied()
    }

    /// Record the checksum of the chunk at `chunk_indices`.
    pub fn set_checksum(&mut self, chunk_indices: &[u64], checksum: u32) {
        self.checksums.insert(chunk_key_name(chunk_indices), checksum);
    }

    /// Forget the chunk at `chunk_indices`.
    pub fn remove_checksum(&mut self, chunk_indices: &[u64]) -> Option<u32> {
        self.checksums.remove(&chunk_key_name(chunk_indices))
    }

    /// Return the chunk indices and checksum of every synchronised chunk.
    pub fn chunks(&self) -> impl Iterator<Item = (ArrayIndices, u32)> + '_ {
        self.checksums
            .iter()
            .filter_map(|(name, &checksum)| Some((parse_chunk_key_name(name)?, checksum)))
    }

    /// Return the coordinate index at the last completed backup.
    #[must_use]
    pub fn coordinates(&self) -> &BTreeMap<String, CoordinateIndex> {
        &self.coordinates
    }

    /// Returns true if the last backup run finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Mark whether the copy mirrors the primary.
    pub fn set_complete(&mut self, complete: bool) {
        self.complete = complete;
    }

    /// Return the time of the last update in milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Record the coordinate index of `layout` as synchronised.
    pub fn set_coordinates(&mut self, layout: &TensorLayout) {
        self.coordinates = std::iter::zip(layout.dims(), layout.coords())
            .map(|(dim, index)| (dim.clone(), index.clone()))
            .collect();
    }

    /// Set the timestamp to now.
    pub fn touch(&mut self) {
        self.timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| {
                u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
            });
    }
}

/// The outcome of a backup or recovery run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display)]
#[display("{chunks_copied} chunks copied, {chunks_skipped} skipped, {chunks_erased} erased")]
pub struct BackupReport {
    /// Chunks copied because their checksum differed or was unknown.
    pub chunks_copied: usize,
    /// Chunks left untouched because their checksum matched.
    pub chunks_skipped: usize,
    /// Chunks erased from the target because the source no longer has them.
    pub chunks_erased: usize,
}
