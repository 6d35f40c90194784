//! Backup and recovery.
//!
//! [`backup`] mirrors a tensor into a destination [`TensorStorage`] and [`update_from_backup`] reconciles a
//! tensor from its backup copy. Both compare CRC-32C checksums of the encoded chunks and copy only the
//! chunks that differ, so re-running either after an interruption completes the remaining chunks.
//!
//! The destination keeps a [`BackupRecord`] of the chunks known to be synchronised.
//! The record is marked incomplete before a run changes the copy, checkpointed every
//! [`backup_checkpoint_interval`](crate::config::Config::backup_checkpoint_interval) copies and when a copy
//! fails, and marked complete when the run finishes. Recovery only trusts a complete record.
//!
//! Backups may run alongside writes to the primary. The copy then holds a checksum-consistent prior state
//! of every chunk, not a snapshot of the tensor at a single instant.

mod backup_record;

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

pub use backup_record::{BackupRecord, BackupReport};

use crate::{
    array_subset::ArrayIndices,
    backend::{chunk_key_name, TensorLayout, TensorStorage},
    config::global_config,
    tensor::{TensorContext, TensorError, TensorOperation},
};

/// Return the checksum of encoded chunk bytes.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

/// Return the checksum of every stored chunk of `storage`.
///
/// # Errors
/// Returns an error if a chunk cannot be listed or retrieved.
pub fn chunk_checksums<S: TensorStorage + ?Sized>(
    storage: &S,
) -> Result<BTreeMap<ArrayIndices, u32>, TensorError> {
    let chunks = storage.stored_chunks()?;
    let checksums = chunks
        .into_par_iter()
        .map(|chunk| -> Result<Option<(ArrayIndices, u32)>, TensorError> {
            Ok(storage
                .retrieve_encoded_chunk(&chunk)?
                .map(|bytes| (chunk, checksum(&bytes))))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(checksums.into_iter().flatten().collect())
}

/// Mirror `primary` to `destination`.
///
/// Copies the chunks whose checksum differs from the backup record of `destination`, or every chunk if there
/// is no record or `overwrite` is set. Chunks no longer in the primary are erased from the backup.
/// The layout and attributes of the primary are written last, together with the updated record.
///
/// # Errors
/// Returns [`TensorError::NotFound`] if the primary does not exist,
/// [`TensorError::AlreadyExists`] if `destination` holds a tensor without a backup record and `overwrite` is false,
/// or the first error of a chunk copy. Progress made before a failure is kept in the record.
pub fn backup<P: TensorStorage + ?Sized>(
    primary: &P,
    destination: &dyn TensorStorage,
    overwrite: bool,
) -> Result<BackupReport, TensorError> {
    let ctx = TensorContext::new(primary.tensor_id(), TensorOperation::Backup);
    let layout = primary.layout()?.ok_or_else(|| ctx.not_found())?;
    let existing = destination.layout_and_record()?;
    let destination_exists = existing.is_some();
    let (checkpoint_layout, mut record, fresh) = match existing {
        Some((_, None)) if !overwrite => return Err(ctx.already_exists()),
        Some((existing_layout, Some(record))) if !overwrite => (existing_layout, record, false),
        Some((existing_layout, _)) => (
            existing_layout,
            BackupRecord::new(primary.tensor_id()),
            true,
        ),
        None => (layout.clone(), BackupRecord::new(primary.tensor_id()), true),
    };
    let checkpoint_interval = global_config().backup_checkpoint_interval();

    let checksums = chunk_checksums(primary)?;
    let mut report = BackupReport::default();

    record.set_complete(false);
    if destination_exists {
        destination.write_layout(&checkpoint_layout, Some(&record))?;
    }

    let mut stale: BTreeSet<ArrayIndices> = record.chunks().map(|(chunk, _)| chunk).collect();
    if fresh {
        stale.extend(destination.stored_chunks()?);
    }
    for chunk in stale {
        if !checksums.contains_key(&chunk) {
            destination.erase_chunk(&chunk)?;
            record.remove_checksum(&chunk);
            report.chunks_erased += 1;
        }
    }

    let copied = copy_changed_chunks(
        primary,
        destination,
        &checksums,
        &mut record,
        &mut report,
        |record| {
            tracing::debug!(
                tensor_id = primary.tensor_id(),
                chunks = record.checksums().len(),
                "backup checkpoint"
            );
            destination.write_layout(&checkpoint_layout, Some(record))
        },
        checkpoint_interval,
    );
    if let Err(err) = copied {
        tracing::warn!(
            tensor_id = primary.tensor_id(),
            %report,
            error = %err,
            "backup failed, checkpointing progress"
        );
        if let Err(checkpoint_err) = destination.write_layout(&checkpoint_layout, Some(&record)) {
            tracing::warn!(
                tensor_id = primary.tensor_id(),
                error = %checkpoint_err,
                "backup checkpoint failed"
            );
        }
        return Err(err);
    }

    record.set_coordinates(&layout);
    record.set_complete(true);
    record.touch();
    destination.write_layout(&layout, Some(&record))?;
    tracing::info!(tensor_id = primary.tensor_id(), %report, "backup complete");
    Ok(report)
}

fn copy_changed_chunks<P: TensorStorage + ?Sized>(
    primary: &P,
    destination: &dyn TensorStorage,
    checksums: &BTreeMap<ArrayIndices, u32>,
    record: &mut BackupRecord,
    report: &mut BackupReport,
    checkpoint: impl Fn(&BackupRecord) -> Result<(), TensorError>,
    checkpoint_interval: usize,
) -> Result<(), TensorError> {
    for (chunk, &expected) in checksums {
        if record.checksum(chunk) == Some(expected) {
            report.chunks_skipped += 1;
            continue;
        }
        // the chunk may have been erased or rewritten since the checksums were computed
        let Some(bytes) = primary.retrieve_encoded_chunk(chunk)? else {
            continue;
        };
        let copied = checksum(&bytes);
        destination.store_encoded_chunk(chunk, bytes)?;
        record.set_checksum(chunk, copied);
        report.chunks_copied += 1;
        if checkpoint_interval > 0 && report.chunks_copied % checkpoint_interval == 0 {
            checkpoint(record)?;
        }
    }
    Ok(())
}

/// Reconcile `primary` from its backup copy in `source`.
///
/// Copies every chunk whose checksum in the backup record differs from the primary, or every chunk if
/// `force_overwrite`. Without a record, checksums are computed from the chunks in `source`. Chunks of the
/// primary absent from the backup are erased, and the layout and attributes of the backup replace those
/// of the primary when they differ. A primary that does not exist is created from the backup.
///
/// A backup whose record is incomplete, left by an interrupted or failed [`backup`], is refused without
/// touching the primary.
///
/// With [`validate_checksums`](crate::config::Config::validate_checksums) enabled, every restored chunk is
/// read back and compared with its expected checksum.
///
/// # Errors
/// Returns [`TensorError::Recovery`] if `source` holds no backup and the primary does not exist, if the
/// backup record is incomplete, or if a chunk listed in the record is missing from `source`.
/// Returns [`TensorError::ChecksumMismatch`] if a backup chunk or a restored chunk does not match its checksum.
pub fn update_from_backup<P: TensorStorage + ?Sized>(
    primary: &P,
    source: &dyn TensorStorage,
    force_overwrite: bool,
) -> Result<BackupReport, TensorError> {
    let ctx = TensorContext::new(primary.tensor_id(), TensorOperation::UpdateFromBackup);
    let primary_layout = primary.layout()?;
    let Some((source_layout, record)) = source.layout_and_record()? else {
        return if primary_layout.is_some() {
            tracing::info!(
                tensor_id = primary.tensor_id(),
                "no backup to update from"
            );
            Ok(BackupReport::default())
        } else {
            Err(ctx.recovery("there is no backup and the tensor does not exist"))
        };
    };
    let expected: BTreeMap<ArrayIndices, u32> = match &record {
        Some(record) if !record.is_complete() => {
            tracing::warn!(
                tensor_id = primary.tensor_id(),
                chunks = record.checksums().len(),
                "backup is incomplete, refusing to update from it"
            );
            return Err(ctx.recovery(
                "the backup is incomplete, finish a backup before updating from it",
            ));
        }
        Some(record) => record.chunks().collect(),
        None => chunk_checksums(source)?,
    };
    let current = chunk_checksums(primary)?;
    let validate_checksums = global_config().validate_checksums();

    let mut report = BackupReport::default();
    for (chunk, &checksum_expected) in &expected {
        if !force_overwrite && current.get(chunk) == Some(&checksum_expected) {
            report.chunks_skipped += 1;
            continue;
        }
        let bytes = source.retrieve_encoded_chunk(chunk)?.ok_or_else(|| {
            ctx.recovery(format!(
                "chunk {} is missing from the backup",
                chunk_key_name(chunk)
            ))
        })?;
        if checksum(&bytes) != checksum_expected {
            return Err(ctx.checksum_mismatch(chunk_key_name(chunk)));
        }
        primary.store_encoded_chunk(chunk, bytes)?;
        if validate_checksums {
            let restored = primary.retrieve_encoded_chunk(chunk)?;
            if restored.map(|bytes| checksum(&bytes)) != Some(checksum_expected) {
                return Err(ctx.checksum_mismatch(chunk_key_name(chunk)));
            }
        }
        report.chunks_copied += 1;
    }
    for chunk in current.keys().filter(|chunk| !expected.contains_key(*chunk)) {
        primary.erase_chunk(chunk)?;
        report.chunks_erased += 1;
    }

    if primary_layout.as_ref() != Some(&source_layout) {
        restore_layout(primary, &source_layout)?;
    }
    tracing::info!(tensor_id = primary.tensor_id(), %report, "updated from backup");
    Ok(report)
}

fn restore_layout<P: TensorStorage + ?Sized>(
    primary: &P,
    layout: &TensorLayout,
) -> Result<(), TensorError> {
    tracing::info!(
        tensor_id = primary.tensor_id(),
        shape = ?layout.shape(),
        "restoring layout from backup"
    );
    primary.write_layout(layout, None)
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use super::*;
    use crate::{
        backend::{ChunkedTensorStorage, MemoryTensorStorage},
        storage::{store::MemoryStore, Bytes},
        tensor::{coordinates, Coordinate, LabeledArray, TensorDescriptor},
    };

    fn descriptor() -> TensorDescriptor {
        TensorDescriptor::new("prices", vec!["time".to_string()], vec![2]).unwrap()
    }

    fn data(times: impl IntoIterator<Item = i64>, offset: f64) -> LabeledArray {
        let times = coordinates(times);
        let values = (0..times.len()).map(|i| offset + i as f64).collect();
        LabeledArray::from_shape_vec(&["time"], vec![times], values).unwrap()
    }

    fn chunked() -> ChunkedTensorStorage {
        ChunkedTensorStorage::new(descriptor(), Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn backup_missing_primary() {
        let primary = chunked();
        let destination = chunked();
        assert!(matches!(
            backup(&primary, &destination, false),
            Err(TensorError::NotFound { .. })
        ));
    }

    #[test]
    fn backup_incremental() -> Result<(), Box<dyn Error>> {
        let primary = chunked();
        let destination = chunked();
        primary.store(data(0..6, 0.0), false)?;

        let report = primary.backup(&destination, false)?;
        assert_eq!(report.chunks_copied, 3);
        assert!(destination.read()?.equals(&primary.read()?));
        let record = destination.backup_record()?.unwrap();
        assert_eq!(record.checksums().len(), 3);
        assert_eq!(record.coordinates()["time"].len(), 6);

        let report = primary.backup(&destination, false)?;
        assert_eq!(report.chunks_copied, 0);
        assert_eq!(report.chunks_skipped, 3);

        primary.append(data([6], 6.0), "time")?;
        let report = primary.backup(&destination, false)?;
        assert_eq!(report.chunks_copied, 1);
        assert!(destination.read()?.equals(&primary.read()?));

        let report = primary.backup(&destination, true)?;
        assert_eq!(report.chunks_copied, 4);
        Ok(())
    }

    #[test]
    fn backup_unmanaged_destination() -> Result<(), Box<dyn Error>> {
        let primary = chunked();
        let destination = chunked();
        primary.store(data(0..6, 0.0), false)?;
        destination.store(data(0..10, 100.0), false)?;
        assert!(matches!(
            primary.backup(&destination, false),
            Err(TensorError::AlreadyExists { .. })
        ));
        let report = primary.backup(&destination, true)?;
        assert_eq!(report.chunks_copied, 3);
        assert_eq!(report.chunks_erased, 2);
        assert!(destination.read()?.equals(&primary.read()?));
        Ok(())
    }

    #[test]
    fn backup_erases_removed_chunks() -> Result<(), Box<dyn Error>> {
        let primary = chunked();
        let destination = MemoryTensorStorage::new(descriptor())?;
        primary.store(data(0..6, 0.0), false)?;
        primary.backup(&destination, false)?;
        primary.store(data(0..2, 0.0), true)?;
        let report = primary.backup(&destination, false)?;
        assert_eq!(report.chunks_erased, 2);
        assert_eq!(report.chunks_skipped, 1);
        assert_eq!(destination.stored_chunks()?, vec![vec![0]]);
        assert!(destination.read()?.equals(&primary.read()?));
        Ok(())
    }

    #[test]
    fn recover_corrupted_chunk() -> Result<(), Box<dyn Error>> {
        let primary = chunked();
        let destination = chunked();
        primary.store(data(0..6, 0.0), false)?;
        primary.backup(&destination, false)?;

        primary.store_encoded_chunk(&[1], Bytes::from(vec![0u8; 16]))?;
        primary.erase_chunk(&[2])?;
        let report = primary.update_from_backup(&destination, false)?;
        assert_eq!(report.chunks_copied, 2);
        assert_eq!(report.chunks_skipped, 1);
        assert!(primary.read()?.equals(&destination.read()?));
        assert_eq!(primary.read()?.get(&[Coordinate::Int(3)]), Some(3.0));

        let report = primary.update_from_backup(&destination, true)?;
        assert_eq!(report.chunks_copied, 3);
        Ok(())
    }

    #[test]
    fn recover_missing_primary() -> Result<(), Box<dyn Error>> {
        let primary = chunked();
        let destination = MemoryTensorStorage::new(descriptor())?;
        assert!(matches!(
            primary.update_from_backup(&destination, false),
            Err(TensorError::Recovery { .. })
        ));

        let source = chunked();
        source.store(data(0..5, 0.0), false)?;
        let mut attributes = crate::tensor::Attributes::new();
        attributes.insert("units".to_string(), "USD".into());
        source.set_attributes(attributes, false)?;
        source.backup(&destination, false)?;

        let report = primary.update_from_backup(&destination, false)?;
        assert_eq!(report.chunks_copied, 3);
        assert!(primary.read()?.equals(&source.read()?));
        assert_eq!(primary.attributes()?["units"], "USD");
        assert!(primary.backup_record()?.is_none());
        Ok(())
    }

    #[test]
    fn recover_without_record() -> Result<(), Box<dyn Error>> {
        let primary = chunked();
        primary.store(data(0..4, 0.0), false)?;
        let empty = chunked();
        assert_eq!(
            primary.update_from_backup(&empty, false)?,
            BackupReport::default()
        );

        let plain_copy = chunked();
        plain_copy.store(data(0..4, 10.0), false)?;
        let report = primary.update_from_backup(&plain_copy, false)?;
        assert_eq!(report.chunks_copied, 2);
        assert!(primary.read()?.equals(&plain_copy.read()?));
        Ok(())
    }

    #[test]
    fn recover_corrupted_backup() -> Result<(), Box<dyn Error>> {
        let primary = chunked();
        let destination = chunked();
        primary.store(data(0..4, 0.0), false)?;
        primary.backup(&destination, false)?;
        destination.store_encoded_chunk(&[0], Bytes::from(vec![1u8; 16]))?;
        primary.erase_chunk(&[0])?;
        assert!(matches!(
            primary.update_from_backup(&destination, false),
            Err(TensorError::ChecksumMismatch { .. })
        ));
        Ok(())
    }
}
