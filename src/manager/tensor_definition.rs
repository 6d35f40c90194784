use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    config::global_config,
    tensor::{Attributes, TensorDescriptor, TensorError},
};

/// The primitive serialising writers to a tensor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Synchronizer {
    /// No serialisation, for a single writer.
    #[display("none")]
    None,
    /// Serialise threads of this process.
    #[default]
    #[display("thread")]
    Thread,
    /// Serialise processes through lock files.
    #[display("process")]
    Process,
}

/// Write coalescing of a tensor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheDefinition {
    /// The dimension writes are coalesced along.
    pub dimension: String,
    /// The maximum number of labels buffered along `dimension`.
    pub max_cached_extent: usize,
}

/// The definition of a tensor, as registered with a [`TensorStorageManager`](super::TensorStorageManager).
///
/// ```json
/// {
///     "dims": ["time", "asset"],
///     "chunks": [256, 64],
///     "synchronizer": "process",
///     "cache": { "dimension": "time", "max_cached_extent": 32 },
///     "attributes": { "units": "USD" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorDefinition {
    /// The dimension names.
    pub dims: Vec<String>,
    /// The chunk size of each dimension.
    pub chunks: Vec<u64>,
    /// The spacing of consecutive integer labels of each dimension, 1 if omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<i64>>,
    /// The writer synchronizer, the [default synchronizer](crate::config::Config::default_synchronizer) if omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronizer: Option<Synchronizer>,
    /// Write coalescing, disabled if omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheDefinition>,
    /// The initial user attributes.
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
}

impl TensorDefinition {
    /// Create a definition with `dims` chunked by `chunks`.
    #[must_use]
    pub fn new(dims: Vec<String>, chunks: Vec<u64>) -> Self {
        Self {
            dims,
            chunks,
            steps: None,
            synchronizer: None,
            cache: None,
            attributes: Attributes::new(),
        }
    }

    /// Parse a definition from JSON.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if `json` is not a tensor definition.
    pub fn from_json(json: &str) -> Result<Self, TensorError> {
        serde_json::from_str(json)
            .map_err(|err| TensorError::Configuration(format!("invalid tensor definition: {err}")))
    }

    /// Set the writer synchronizer.
    #[must_use]
    pub fn with_synchronizer(mut self, synchronizer: Synchronizer) -> Self {
        self.synchronizer = Some(synchronizer);
        self
    }

    /// Coalesce writes along `dimension`, buffering at most `max_cached_extent` labels.
    #[must_use]
    pub fn with_cache(mut self, dimension: impl Into<String>, max_cached_extent: usize) -> Self {
        self.cache = Some(CacheDefinition {
            dimension: dimension.into(),
            max_cached_extent,
        });
        self
    }

    /// Return the writer synchronizer, falling back to the configured default.
    #[must_use]
    pub fn synchronizer(&self) -> Synchronizer {
        self.synchronizer
            .unwrap_or_else(|| global_config().default_synchronizer())
    }

    /// Return the descriptor of the tensor `tensor_id` with this definition.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the definition is invalid.
    pub fn descriptor(&self, tensor_id: &str) -> Result<TensorDescriptor, TensorError> {
        let descriptor = TensorDescriptor::new(tensor_id, self.dims.clone(), self.chunks.clone())?
            .with_attributes(self.attributes.clone());
        match &self.steps {
            Some(steps) => descriptor.with_steps(steps.clone()),
            None => Ok(descriptor),
        }
    }

    /// Validate the definition of the tensor `tensor_id`.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the dimensions, chunks or steps are invalid,
    /// or the cache names an unknown dimension or a zero extent.
    pub fn validate(&self, tensor_id: &str) -> Result<(), TensorError> {
        self.descriptor(tensor_id)?;
        if let Some(cache) = &self.cache {
            if !self.dims.contains(&cache.dimension) {
                return Err(TensorError::Configuration(format!(
                    "tensor {tensor_id} caches unknown dimension {}",
                    cache.dimension
                )));
            }
            if cache.max_cached_extent == 0 {
                return Err(TensorError::Configuration(format!(
                    "tensor {tensor_id} has a zero maximum cached extent"
                )));
            }
        }
        Ok(())
    }
}
