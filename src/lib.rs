//! A rust library for chunked, attribute-bearing storage of labeled tensors.
//!
//! A tensor is a labeled n-dimensional array of `f64` values that grows along its dimensions over time.
//! `tensordb` persists every tensor as a [Zarr V3](https://zarr.dev) array of chunks in a key/value store and
//! provides
//!  - logical writes that translate into chunk writes: [`store`](backend::TensorStorage::store),
//!    [`append`](backend::TensorStorage::append), [`update`](backend::TensorStorage::update),
//!    [`upsert`](backend::TensorStorage::upsert) and [`drop_labels`](backend::TensorStorage::drop_labels),
//!  - write coalescing of many small sequential writes with [`CachedTensor`](cached_tensor::CachedTensor),
//!  - incremental, checksum-driven [`backup`](backup::backup) and [`recovery`](backup::update_from_backup), and
//!  - a [`TensorStorageManager`](manager::TensorStorageManager) owning tensor definitions, writer locks and open handles.
//!
//! ## Getting Started
//! [`backend::TensorStorage`] and [`manager`] are good places to start.
//!
//! ## Example
//! ```rust
//! # use std::sync::Arc;
//! use tensordb::backend::{ChunkedTensorStorage, TensorStorage};
//! use tensordb::storage::store::MemoryStore;
//! use tensordb::tensor::{coordinates, LabeledArray, TensorDescriptor};
//!
//! let store = Arc::new(MemoryStore::new());
//! let descriptor = TensorDescriptor::new("prices", vec!["time".to_string()], vec![4])?;
//! let tensor = ChunkedTensorStorage::new(descriptor, store)?;
//!
//! let data = LabeledArray::from_shape_vec(&["time"], vec![coordinates(0..3)], vec![1.0, 2.0, 3.0])?;
//! tensor.store(data, false)?;
//! let data = LabeledArray::from_shape_vec(&["time"], vec![coordinates([3])], vec![4.0])?;
//! tensor.append(data, "time")?;
//! assert_eq!(tensor.read()?.shape(), &[4]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Logging
//! `tensordb` emits [`tracing`] events and never installs a subscriber.
//!
//! ## Licence
//! `tensordb` is licensed under either of
//!  - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//!  - the MIT license <http://opensource.org/licenses/MIT>, at your option.

#![warn(unused_variables)]
#![warn(dead_code)]
#![deny(missing_docs)]
// #![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![deny(clippy::missing_panics_doc)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod array_subset;
pub mod backend;
pub mod backup;
pub mod cached_tensor;
pub mod chunk_geometry;
pub mod config;
pub mod manager;
pub mod storage;
pub mod tensor;
