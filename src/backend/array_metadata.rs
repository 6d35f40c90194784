//! Persisted tensor metadata.
//!
//! A tensor is stored as a Zarr V3 array of `float64` values under `<tensor_id>/`:
//! ```json
//! {
//!     "zarr_format": 3,
//!     "node_type": "array",
//!     "shape": [10, 3],
//!     "dimension_names": ["time", "asset"],
//!     "data_type": "float64",
//!     "chunk_grid": {
//!         "name": "regular",
//!         "configuration": { "chunk_shape": [4, 3] }
//!     },
//!     "chunk_key_encoding": {
//!         "name": "default",
//!         "configuration": { "separator": "/" }
//!     },
//!     "codecs": [{ "name": "bytes", "configuration": { "endian": "little" } }],
//!     "fill_value": "NaN",
//!     "attributes": {
//!         "_tensordb_coordinates": { "time": [0, 1, 2], "asset": ["a", "b", "c"] },
//!         "_tensordb_steps": { "time": 1, "asset": 1 },
//!         "units": "USD"
//!     }
//! }
//! ```
//! The coordinate index is consolidated into the metadata so that opening a tensor reads a single key.
//! Chunks are stored at `<tensor_id>/c/<i>/<j>/...` as little-endian `f64`, always at the full chunk shape.

use bytes::Bytes;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    array_subset::{ArrayIndices, ArrayShape},
    backup::BackupRecord,
    chunk_geometry::{ChunkGeometry, ChunkGeometryError},
    tensor::{Attributes, CoordinateIndex, TensorDescriptor},
};

/// The reserved attribute holding the coordinate index.
pub const COORDINATES_ATTRIBUTE: &str = "_tensordb_coordinates";
/// The reserved attribute holding the integer label spacing.
pub const STEPS_ATTRIBUTE: &str = "_tensordb_steps";
/// The reserved attribute holding the backup record of a backup copy.
pub const BACKUP_RECORD_ATTRIBUTE: &str = "_tensordb_backup_record";

/// Attributes managed by tensordb, never exposed as user attributes.
pub const RESERVED_ATTRIBUTES: [&str; 3] = [
    COORDINATES_ATTRIBUTE,
    STEPS_ATTRIBUTE,
    BACKUP_RECORD_ATTRIBUTE,
];

/// The name of the metadata key of a tensor.
pub const METADATA_NAME: &str = "zarr.json";

/// The prefix name under which chunks are stored.
pub const CHUNK_PREFIX_NAME: &str = "c";

/// Metadata with a name and an optional configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MetadataV3 {
    /// The name.
    pub name: String,
    /// The configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Map<String, Value>>,
}

impl MetadataV3 {
    fn new(name: &str, configuration: Value) -> Self {
        Self {
            name: name.to_string(),
            configuration: match configuration {
                Value::Object(configuration) => Some(configuration),
                _ => None,
            },
        }
    }

    fn configuration_value(&self, key: &str) -> Option<&Value> {
        self.configuration.as_ref().and_then(|c| c.get(key))
    }
}

/// Zarr V3 array metadata, restricted to what tensordb writes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ArrayMetadata {
    /// Must be `3`.
    pub zarr_format: u64,
    /// Must be `array`.
    pub node_type: String,
    /// The length of each dimension.
    pub shape: ArrayShape,
    /// The data type, `float64`.
    pub data_type: String,
    /// The chunk grid.
    pub chunk_grid: MetadataV3,
    /// The chunk key encoding.
    pub chunk_key_encoding: MetadataV3,
    /// The fill value, `"NaN"`.
    pub fill_value: Value,
    /// The codecs.
    pub codecs: Vec<MetadataV3>,
    /// Attributes, including the reserved tensordb attributes.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    /// The dimension names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension_names: Option<Vec<String>>,
}

/// The structure of a stored tensor: its dimensions, chunking, coordinate index and user attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorLayout {
    dims: Vec<String>,
    chunks: Vec<u64>,
    steps: Vec<i64>,
    coords: Vec<CoordinateIndex>,
    attributes: Attributes,
}

impl TensorLayout {
    /// Create the layout of a new tensor described by `descriptor` with coordinate index `coords`.
    #[must_use]
    pub fn new(descriptor: &TensorDescriptor, coords: Vec<CoordinateIndex>) -> Self {
        Self {
            dims: descriptor.dims().to_vec(),
            chunks: descriptor.chunks().to_vec(),
            steps: descriptor.steps().to_vec(),
            coords,
            attributes: descriptor.attributes().clone(),
        }
    }

    /// Return the dimension names.
    #[must_use]
    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    /// Return the chunk shape.
    #[must_use]
    pub fn chunks(&self) -> &[u64] {
        &self.chunks
    }

    /// Return the integer label spacing of every dimension.
    #[must_use]
    pub fn steps(&self) -> &[i64] {
        &self.steps
    }

    /// Return the coordinate index of every dimension.
    #[must_use]
    pub fn coords(&self) -> &[CoordinateIndex] {
        &self.coords
    }

    /// Return the user attributes.
    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub(crate) fn coords_mut(&mut self) -> &mut Vec<CoordinateIndex> {
        &mut self.coords
    }

    pub(crate) fn set_attributes(&mut self, attributes: Attributes) {
        self.attributes = attributes;
    }

    /// Return the axis of `dim`.
    #[must_use]
    pub fn axis(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    /// Return the shape of the tensor.
    #[must_use]
    pub fn shape(&self) -> ArrayShape {
        self.coords.iter().map(|index| index.len() as u64).collect()
    }

    /// Return the chunk geometry.
    ///
    /// # Errors
    /// Returns a [`ChunkGeometryError`] if the chunk shape is invalid.
    pub fn geometry(&self) -> Result<ChunkGeometry, ChunkGeometryError> {
        ChunkGeometry::new(&self.chunks)
    }

    /// Convert to array metadata, embedding `record` if this is a backup copy.
    ///
    /// # Errors
    /// Returns a [`serde_json::Error`] if the coordinate index or record cannot be serialised.
    pub fn to_metadata(
        &self,
        record: Option<&BackupRecord>,
    ) -> Result<ArrayMetadata, serde_json::Error> {
        let mut attributes = Map::new();
        let coordinates: Map<String, Value> = self
            .dims
            .iter()
            .zip(&self.coords)
            .map(|(dim, index)| Ok((dim.clone(), serde_json::to_value(index)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        attributes.insert(COORDINATES_ATTRIBUTE.to_string(), Value::Object(coordinates));
        let steps: Map<String, Value> = self
            .dims
            .iter()
            .zip(&self.steps)
            .map(|(dim, &step)| (dim.clone(), Value::from(step)))
            .collect();
        attributes.insert(STEPS_ATTRIBUTE.to_string(), Value::Object(steps));
        if let Some(record) = record {
            attributes.insert(
                BACKUP_RECORD_ATTRIBUTE.to_string(),
                serde_json::to_value(record)?,
            );
        }
        attributes.extend(self.attributes.clone());

        Ok(ArrayMetadata {
            zarr_format: 3,
            node_type: "array".to_string(),
            shape: self.shape(),
            data_type: "float64".to_string(),
            chunk_grid: MetadataV3::new(
                "regular",
                serde_json::json!({ "chunk_shape": self.chunks }),
            ),
            chunk_key_encoding: MetadataV3::new(
                "default",
                serde_json::json!({ "separator": "/" }),
            ),
            fill_value: Value::from("NaN"),
            codecs: vec![MetadataV3::new(
                "bytes",
                serde_json::json!({ "endian": "little" }),
            )],
            attributes,
            dimension_names: Some(self.dims.clone()),
        })
    }

    /// Parse array metadata written by [`TensorLayout::to_metadata`].
    ///
    /// Returns the layout and the embedded backup record, if any.
    ///
    /// # Errors
    /// Returns a description of the problem if the metadata is not a tensordb array.
    pub fn from_metadata(
        metadata: ArrayMetadata,
    ) -> Result<(Self, Option<BackupRecord>), String> {
        if metadata.zarr_format != 3 || metadata.node_type != "array" {
            return Err("not a zarr v3 array".to_string());
        }
        if metadata.data_type != "float64" {
            return Err(format!("unsupported data type {}", metadata.data_type));
        }
        if metadata.chunk_grid.name != "regular" {
            return Err(format!(
                "unsupported chunk grid {}",
                metadata.chunk_grid.name
            ));
        }
        let separator = metadata
            .chunk_key_encoding
            .configuration_value("separator")
            .and_then(Value::as_str)
            .unwrap_or("/");
        if metadata.chunk_key_encoding.name != "default" || separator != "/" {
            return Err("unsupported chunk key encoding".to_string());
        }
        match metadata.codecs.as_slice() {
            [codec]
                if codec.name == "bytes"
                    && codec
                        .configuration_value("endian")
                        .and_then(Value::as_str)
                        .map_or(true, |endian| endian == "little") => {}
            _ => return Err("unsupported codecs".to_string()),
        }
        let chunks: Vec<u64> = metadata
            .chunk_grid
            .configuration_value("chunk_shape")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| err.to_string())?
            .ok_or("missing chunk shape")?;
        let dims = metadata.dimension_names.ok_or("missing dimension names")?;
        if chunks.len() != dims.len() || metadata.shape.len() != dims.len() {
            return Err("inconsistent dimensionality".to_string());
        }

        let mut attributes = metadata.attributes;
        let coordinates = attributes
            .remove(COORDINATES_ATTRIBUTE)
            .ok_or("missing coordinate index")?;
        let mut coordinates: Map<String, Value> =
            serde_json::from_value(coordinates).map_err(|err| err.to_string())?;
        let mut coords = Vec::with_capacity(dims.len());
        for (dim, &extent) in dims.iter().zip(&metadata.shape) {
            let index: CoordinateIndex = coordinates
                .remove(dim)
                .map(serde_json::from_value)
                .transpose()
                .map_err(|err| format!("coordinates of {dim}: {err}"))?
                .ok_or_else(|| format!("missing coordinates of {dim}"))?;
            if index.len() as u64 != extent {
                return Err(format!(
                    "dimension {dim} has {} labels but extent {extent}",
                    index.len()
                ));
            }
            coords.push(index);
        }
        let steps: Map<String, Value> = attributes
            .remove(STEPS_ATTRIBUTE)
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| err.to_string())?
            .unwrap_or_default();
        let steps = dims
            .iter()
            .map(|dim| steps.get(dim).and_then(Value::as_i64).unwrap_or(1))
            .collect();
        let record = attributes
            .remove(BACKUP_RECORD_ATTRIBUTE)
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| format!("backup record: {err}"))?;

        Ok((
            Self {
                dims,
                chunks,
                steps,
                coords,
                attributes,
            },
            record,
        ))
    }
}

/// Return the name of the chunk at `chunk_indices` relative to the tensor prefix, e.g. `c/0/1`.
#[must_use]
pub fn chunk_key_name(chunk_indices: &[u64]) -> String {
    std::iter::once(CHUNK_PREFIX_NAME.to_string())
        .chain(chunk_indices.iter().map(ToString::to_string))
        .collect::<Vec<_>>()
        .join("/")
}

/// Parse a chunk name produced by [`chunk_key_name`].
#[must_use]
pub fn parse_chunk_key_name(name: &str) -> Option<ArrayIndices> {
    let indices = name.strip_prefix(CHUNK_PREFIX_NAME)?.strip_prefix('/')?;
    indices
        .split('/')
        .map(|index| index.parse().ok())
        .collect()
}

/// Encode chunk values as little-endian `f64` in C order.
#[must_use]
pub fn encode_chunk(values: &ArrayD<f64>) -> Bytes {
    let mut bytes = Vec::with_capacity(values.len() * std::mem::size_of::<f64>());
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Bytes::from(bytes)
}

/// Decode chunk values encoded by [`encode_chunk`] with `shape`.
///
/// # Errors
/// Returns a description of the problem if the number of bytes does not match `shape`.
pub fn decode_chunk(bytes: &[u8], shape: &[u64]) -> Result<ArrayD<f64>, String> {
    let shape: Vec<usize> = shape
        .iter()
        .map(|&size| usize::try_from(size).map_err(|err| err.to_string()))
        .collect::<Result<_, _>>()?;
    let expected = shape.iter().product::<usize>() * std::mem::size_of::<f64>();
    if bytes.len() != expected {
        return Err(format!(
            "chunk has {} bytes, expected {expected}",
            bytes.len()
        ));
    }
    let values = bytes
        .chunks_exact(std::mem::size_of::<f64>())
        .map(|value| {
            let mut le = [0u8; 8];
            le.copy_from_slice(value);
            f64::from_le_bytes(le)
        })
        .collect();
    ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|err| err.to_string())
}
