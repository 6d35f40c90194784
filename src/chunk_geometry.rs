//! Chunk geometry.
//!
//! Pure functions mapping array index ranges onto a regular chunk grid:
//!  - the chunks overlapped by a write along one dimension and whether each is fully or partially covered,
//!  - the chunk owning each of an arbitrary set of positions (writes to non-adjacent coordinates), and
//!  - the relation between two coordinate ranges (contiguous, overlapping or disjoint).
//!
//! Invalid input (no dimensions, a zero chunk size, an empty range) fails fast with a [`ChunkGeometryError`].

use std::{num::NonZeroU64, ops::Range};

use itertools::Itertools;
use thiserror::Error;

use crate::array_subset::{ArrayIndices, ArrayShape, ArraySubset};

/// A chunk geometry error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChunkGeometryError {
    /// The geometry has no dimensions.
    #[error("a chunk grid must have at least one dimension")]
    EmptyDimensions,
    /// A chunk size is zero.
    #[error("chunk size for dimension {0} must be positive")]
    InvalidChunkSize(usize),
    /// A range is empty.
    #[error("range {0:?} is empty")]
    EmptyRange(Range<u64>),
    /// An index lies outside of the array extent.
    #[error("index {0} is outside of extent {1}")]
    OutOfBounds(u64, u64),
    /// The dimensionality of an input does not match the geometry.
    #[error("incompatible dimensionality {0}, expected {1}")]
    IncompatibleDimensionality(usize, usize),
}

/// How much of a chunk a write covers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Coverage {
    /// Every element of the chunk (within the array extent) is written, so the chunk can be written without a read.
    Full,
    /// Some elements are written, the chunk must be read, merged and rewritten.
    Partial,
}

/// A chunk overlapped by a contiguous range along one dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkCoverage {
    /// The chunk index along the dimension.
    pub chunk: u64,
    /// Whether the range fully or partially covers the chunk.
    pub coverage: Coverage,
}

/// The positions along one dimension which fall in a single chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkPositions {
    /// The chunk index along the dimension.
    pub chunk: u64,
    /// Whether the positions fully or partially cover the chunk.
    pub coverage: Coverage,
    /// `(source, offset)` pairs: the index of the position in the input and its offset within the chunk.
    pub offsets: Vec<(usize, u64)>,
}

/// The relation between two ranges.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RangeRelation {
    /// The ranges touch end to start with no gap.
    Contiguous,
    /// The ranges share at least one element.
    Overlapping,
    /// There is a gap between the ranges.
    Disjoint,
}

/// Classify the relation between two non-empty half-open ranges.
///
/// # Errors
/// Returns [`ChunkGeometryError::EmptyRange`] if either range is empty.
pub fn classify_ranges(
    existing: &Range<u64>,
    incoming: &Range<u64>,
) -> Result<RangeRelation, ChunkGeometryError> {
    for range in [existing, incoming] {
        if range.is_empty() {
            return Err(ChunkGeometryError::EmptyRange(range.clone()));
        }
    }
    Ok(
        if incoming.start < existing.end && existing.start < incoming.end {
            RangeRelation::Overlapping
        } else if incoming.start == existing.end || incoming.end == existing.start {
            RangeRelation::Contiguous
        } else {
            RangeRelation::Disjoint
        },
    )
}

fn chunk_extent(chunk_size: u64, chunk: u64, extent: u64) -> Range<u64> {
    let start = chunk * chunk_size;
    start..(start + chunk_size).min(extent)
}

/// Return the chunks along one dimension overlapped by `range`, in ascending order.
///
/// A chunk is [`Coverage::Full`] if `range` covers all of it that lies within `extent`.
///
/// # Errors
/// Returns a [`ChunkGeometryError`] if `chunk_size` is zero, `range` is empty, or `range` exceeds `extent`.
pub fn chunks_overlapping(
    chunk_size: u64,
    range: &Range<u64>,
    extent: u64,
) -> Result<Vec<ChunkCoverage>, ChunkGeometryError> {
    if chunk_size == 0 {
        return Err(ChunkGeometryError::InvalidChunkSize(0));
    }
    if range.is_empty() {
        return Err(ChunkGeometryError::EmptyRange(range.clone()));
    }
    if range.end > extent {
        return Err(ChunkGeometryError::OutOfBounds(range.end - 1, extent));
    }
    let first = range.start / chunk_size;
    let last = (range.end - 1) / chunk_size;
    Ok((first..=last)
        .map(|chunk| {
            let chunk_range = chunk_extent(chunk_size, chunk, extent);
            let coverage = if range.start <= chunk_range.start && range.end >= chunk_range.end {
                Coverage::Full
            } else {
                Coverage::Partial
            };
            ChunkCoverage { chunk, coverage }
        })
        .collect())
}

/// Group ascending, unique `positions` along one dimension by the chunk they fall in.
///
/// # Errors
/// Returns a [`ChunkGeometryError`] if `chunk_size` is zero, `positions` is empty, or a position exceeds `extent`.
pub fn chunks_for_positions(
    chunk_size: u64,
    positions: &[u64],
    extent: u64,
) -> Result<Vec<ChunkPositions>, ChunkGeometryError> {
    if chunk_size == 0 {
        return Err(ChunkGeometryError::InvalidChunkSize(0));
    }
    if positions.is_empty() {
        return Err(ChunkGeometryError::EmptyRange(0..0));
    }
    if let Some(&position) = positions.iter().find(|&&position| position >= extent) {
        return Err(ChunkGeometryError::OutOfBounds(position, extent));
    }
    let groups = positions
        .iter()
        .enumerate()
        .chunk_by(|&(_, &position)| position / chunk_size);
    let chunks: Vec<ChunkPositions> = (&groups)
        .into_iter()
        .map(|(chunk, group)| {
            let chunk_range = chunk_extent(chunk_size, chunk, extent);
            let offsets: Vec<(usize, u64)> = group
                .map(|(source, &position)| (source, position - chunk_range.start))
                .collect();
            let coverage = if offsets.len() as u64 == chunk_range.end - chunk_range.start {
                Coverage::Full
            } else {
                Coverage::Partial
            };
            ChunkPositions {
                chunk,
                coverage,
                offsets,
            }
        })
        .collect();
    Ok(chunks)
}

/// A regular chunk grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkGeometry {
    chunk_shape: Vec<NonZeroU64>,
}

impl ChunkGeometry {
    /// Create a new chunk geometry with `chunk_shape`.
    ///
    /// # Errors
    /// Returns a [`ChunkGeometryError`] if `chunk_shape` is empty or has a zero element.
    pub fn new(chunk_shape: &[u64]) -> Result<Self, ChunkGeometryError> {
        if chunk_shape.is_empty() {
            return Err(ChunkGeometryError::EmptyDimensions);
        }
        let chunk_shape = chunk_shape
            .iter()
            .enumerate()
            .map(|(dimension, &size)| {
                NonZeroU64::new(size).ok_or(ChunkGeometryError::InvalidChunkSize(dimension))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { chunk_shape })
    }

    /// Return the chunk shape.
    #[must_use]
    pub fn chunk_shape(&self) -> ArrayShape {
        self.chunk_shape.iter().map(|size| size.get()).collect()
    }

    /// Return the dimensionality of the grid.
    #[must_use]
    pub fn dimensionality(&self) -> usize {
        self.chunk_shape.len()
    }

    fn check(&self, len: usize) -> Result<(), ChunkGeometryError> {
        if len == self.dimensionality() {
            Ok(())
        } else {
            Err(ChunkGeometryError::IncompatibleDimensionality(
                len,
                self.dimensionality(),
            ))
        }
    }

    /// Return the number of chunks along each dimension of an array with `array_shape`.
    ///
    /// # Errors
    /// Returns [`ChunkGeometryError::IncompatibleDimensionality`] if `array_shape` does not match the grid.
    pub fn grid_shape(&self, array_shape: &[u64]) -> Result<ArrayShape, ChunkGeometryError> {
        self.check(array_shape.len())?;
        Ok(std::iter::zip(array_shape, &self.chunk_shape)
            .map(|(&extent, size)| extent.div_ceil(size.get()))
            .collect())
    }

    /// Return the subset of the array covered by the chunk at `chunk_indices`, bounded by `array_shape`.
    ///
    /// # Errors
    /// Returns [`ChunkGeometryError::IncompatibleDimensionality`] if the inputs do not match the grid.
    pub fn chunk_subset(
        &self,
        chunk_indices: &[u64],
        array_shape: &[u64],
    ) -> Result<ArraySubset, ChunkGeometryError> {
        self.check(chunk_indices.len())?;
        self.check(array_shape.len())?;
        let ranges: Vec<_> = itertools::izip!(chunk_indices, &self.chunk_shape, array_shape)
            .map(|(&chunk, size, &extent)| chunk_extent(size.get(), chunk, extent))
            .collect();
        Ok(ArraySubset::new_with_ranges(&ranges))
    }

    /// Return the chunk indices of every chunk overlapping `subset`, in C order.
    ///
    /// # Errors
    /// Returns a [`ChunkGeometryError`] if `subset` does not match the grid or exceeds `array_shape`.
    pub fn chunks_in_subset(
        &self,
        subset: &ArraySubset,
        array_shape: &[u64],
    ) -> Result<Vec<ArrayIndices>, ChunkGeometryError> {
        self.check(subset.dimensionality())?;
        self.check(array_shape.len())?;
        if subset.is_empty() {
            return Ok(vec![]);
        }
        let per_dimension = itertools::izip!(subset.to_ranges(), &self.chunk_shape, array_shape)
            .map(|(range, size, &extent)| {
                chunks_overlapping(size.get(), &range, extent)
                    .map(|chunks| chunks.into_iter().map(|chunk| chunk.chunk).collect_vec())
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(per_dimension
            .into_iter()
            .multi_cartesian_product()
            .collect())
    }
}
