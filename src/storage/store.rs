//! Stores.
//!
//! Both stores are safe to share between threads. Values are replaced whole, there are no partial writes.

mod filesystem_store;
mod memory_store;

pub use filesystem_store::{FilesystemStore, FilesystemStoreCreateError};
pub use memory_store::MemoryStore;
