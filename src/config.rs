//! Tensordb global configuration options.

use std::sync::OnceLock;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::manager::Synchronizer;

/// Global configuration options for the tensordb crate.
///
/// Retrieve the global [`Config`] with [`global_config`] and modify it with [`global_config_mut`].
///
/// ## Validate Checksums
///  > default: [`true`]
///
/// If enabled, recovery re-reads every chunk it copies into a primary tensor and fails with
/// [`TensorError::ChecksumMismatch`](crate::tensor::TensorError::ChecksumMismatch) if the copy does not match the recorded checksum.
///
/// ## Backup Checkpoint Interval
///  > default: `16`
///
/// The number of chunk copies after which a backup persists its [`BackupRecord`](crate::backup::BackupRecord) mid-run.
/// An interrupted backup resumes from the last checkpoint. The record is always persisted at the end of a run and when a run fails.
/// Checkpointing is disabled if set to zero.
///
/// ## Default Synchronizer
///  > default: [`Synchronizer::Thread`]
///
/// The synchronizer used for tensors whose definition does not name one.
#[derive(Debug, Clone)]
pub struct Config {
    validate_checksums: bool,
    backup_checkpoint_interval: usize,
    default_synchronizer: Synchronizer,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            validate_checksums: true,
            backup_checkpoint_interval: 16,
            default_synchronizer: Synchronizer::Thread,
        }
    }
}

impl Config {
    /// Get the [validate checksums](#validate-checksums) configuration.
    #[must_use]
    pub fn validate_checksums(&self) -> bool {
        self.validate_checksums
    }

    /// Set the [validate checksums](#validate-checksums) configuration.
    pub fn set_validate_checksums(&mut self, validate_checksums: bool) -> &mut Self {
        self.validate_checksums = validate_checksums;
        self
    }

    /// Get the [backup checkpoint interval](#backup-checkpoint-interval) configuration.
    #[must_use]
    pub fn backup_checkpoint_interval(&self) -> usize {
        self.backup_checkpoint_interval
    }

    /// Set the [backup checkpoint interval](#backup-checkpoint-interval) configuration.
    pub fn set_backup_checkpoint_interval(&mut self, interval: usize) -> &mut Self {
        self.backup_checkpoint_interval = interval;
        self
    }

    /// Get the [default synchronizer](#default-synchronizer) configuration.
    #[must_use]
    pub fn default_synchronizer(&self) -> Synchronizer {
        self.default_synchronizer
    }

    /// Set the [default synchronizer](#default-synchronizer) configuration.
    pub fn set_default_synchronizer(&mut self, synchronizer: Synchronizer) -> &mut Self {
        self.default_synchronizer = synchronizer;
        self
    }
}

static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Returns a reference to the global tensordb configuration.
///
/// The returned guard must be dropped before calling [`global_config_mut`] on the same thread.
pub fn global_config() -> RwLockReadGuard<'static, Config> {
    CONFIG.get_or_init(|| RwLock::new(Config::default())).read()
}

/// Returns a mutable reference to the global tensordb configuration.
///
/// The returned guard must be dropped before calling [`global_config`] on the same thread.
pub fn global_config_mut() -> RwLockWriteGuard<'static, Config> {
    CONFIG.get_or_init(|| RwLock::new(Config::default())).write()
}
