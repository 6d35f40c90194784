use serde_json::{Map, Value};

use crate::chunk_geometry::ChunkGeometry;

use super::TensorError;

/// User attributes of a tensor.
pub type Attributes = Map<String, Value>;

/// The identity, dimensions and chunking of a tensor.
///
/// The dimension set is fixed once the tensor is stored. Dimensions grow only along existing axes.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorDescriptor {
    id: String,
    dims: Vec<String>,
    chunks: Vec<u64>,
    steps: Vec<i64>,
    attributes: Attributes,
}

impl TensorDescriptor {
    /// Create a new tensor descriptor with `chunks[i]` the chunk size of `dims[i]`.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the identifier is empty, there are no dimensions,
    /// the dimensions are not unique, or a chunk size is missing or zero.
    pub fn new(
        id: impl Into<String>,
        dims: Vec<String>,
        chunks: Vec<u64>,
    ) -> Result<Self, TensorError> {
        let id = id.into();
        if id.trim_matches('/').is_empty() {
            return Err(TensorError::Configuration(
                "a tensor identifier must not be empty".to_string(),
            ));
        }
        if dims.len() != chunks.len() {
            return Err(TensorError::Configuration(format!(
                "tensor {id} has {} dimensions but {} chunk sizes",
                dims.len(),
                chunks.len()
            )));
        }
        for (i, dim) in dims.iter().enumerate() {
            if dim.is_empty() || dims[..i].contains(dim) {
                return Err(TensorError::Configuration(format!(
                    "tensor {id} has an empty or duplicate dimension {dim:?}"
                )));
            }
        }
        ChunkGeometry::new(&chunks)?;
        let steps = vec![1; dims.len()];
        Ok(Self {
            id,
            dims,
            chunks,
            steps,
            attributes: Attributes::new(),
        })
    }

    /// Set the spacing of integer labels of every dimension.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the number of steps does not match the dimensions or a step is not positive.
    pub fn with_steps(mut self, steps: Vec<i64>) -> Result<Self, TensorError> {
        if steps.len() != self.dims.len() || steps.iter().any(|&step| step <= 0) {
            return Err(TensorError::Configuration(format!(
                "tensor {} requires one positive step per dimension, got {steps:?}",
                self.id
            )));
        }
        self.steps = steps;
        Ok(self)
    }

    /// Set the attributes written when the tensor is first stored.
    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Return the tensor identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Return the dimension names.
    #[must_use]
    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    /// Return the chunk size of every dimension.
    #[must_use]
    pub fn chunks(&self) -> &[u64] {
        &self.chunks
    }

    /// Return the integer label spacing of every dimension.
    #[must_use]
    pub fn steps(&self) -> &[i64] {
        &self.steps
    }

    /// Return the initial attributes.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Return the axis of `dim`.
    #[must_use]
    pub fn axis(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    /// Return the chunk size of `dim`.
    #[must_use]
    pub fn chunk_size(&self, dim: &str) -> Option<u64> {
        self.axis(dim).map(|axis| self.chunks[axis])
    }
}
