//! Array subsets.
//!
//! An [`ArraySubset`] is a hyper-rectangular region of an array, described by a start and a shape.
//! Chunks, the extents covered by writes, and masked regions during read-modify-write are all array subsets.

use std::ops::Range;

use derive_more::Display;
use itertools::{izip, Itertools};
use thiserror::Error;

/// An array index.
pub type ArrayIndices = Vec<u64>;

/// An array shape.
pub type ArrayShape = Vec<u64>;

/// An array subset.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Default)]
#[display("start {start:?} shape {shape:?}")]
pub struct ArraySubset {
    /// The start of the array subset.
    start: ArrayIndices,
    /// The shape of the array subset.
    shape: ArrayShape,
}

impl ArraySubset {
    /// Create a new array subset with `shape` starting at the origin.
    #[must_use]
    pub fn new_with_shape(shape: ArrayShape) -> Self {
        Self {
            start: vec![0; shape.len()],
            shape,
        }
    }

    /// Create a new array subset.
    ///
    /// # Errors
    /// Returns [`IncompatibleDimensionalityError`] if the length of `start` and `shape` do not match.
    pub fn new_with_start_shape(
        start: ArrayIndices,
        shape: ArrayShape,
    ) -> Result<Self, IncompatibleDimensionalityError> {
        if start.len() == shape.len() {
            Ok(Self { start, shape })
        } else {
            Err(IncompatibleDimensionalityError::new(
                start.len(),
                shape.len(),
            ))
        }
    }

    /// Create a new array subset from a list of [`Range`]s.
    #[must_use]
    pub fn new_with_ranges(ranges: &[Range<u64>]) -> Self {
        let start = ranges.iter().map(|range| range.start).collect();
        let shape = ranges
            .iter()
            .map(|range| range.end.saturating_sub(range.start))
            .collect();
        Self { start, shape }
    }

    /// Return the start of the array subset.
    #[must_use]
    pub fn start(&self) -> &[u64] {
        &self.start
    }

    /// Return the shape of the array subset.
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Return the shape of the array subset as `usize`s, for use with [`ndarray`].
    #[must_use]
    pub fn shape_usize(&self) -> Vec<usize> {
        self.shape.iter().map(|&size| to_usize(size)).collect()
    }

    /// Return the dimensionality of the array subset.
    #[must_use]
    pub fn dimensionality(&self) -> usize {
        self.start.len()
    }

    /// Return the end (exclusive) of the array subset.
    #[must_use]
    pub fn end_exc(&self) -> ArrayIndices {
        std::iter::zip(&self.start, &self.shape)
            .map(|(start, size)| start + size)
            .collect()
    }

    /// Return the array subset as one [`Range`] per dimension.
    #[must_use]
    pub fn to_ranges(&self) -> Vec<Range<u64>> {
        std::iter::zip(&self.start, &self.shape)
            .map(|(&start, &size)| start..start + size)
            .collect()
    }

    /// Return the number of elements of the array subset.
    ///
    /// Equal to the product of the components of its shape.
    #[must_use]
    pub fn num_elements(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Returns true if the array subset contains no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shape.iter().any(|&size| size == 0)
    }

    /// Bound the array subset to the domain within `end` (exclusive).
    ///
    /// # Errors
    /// Returns an error if `end` does not match the array subset dimensionality.
    pub fn bound(&self, end: &[u64]) -> Result<Self, IncompatibleDimensionalityError> {
        if end.len() != self.dimensionality() {
            return Err(IncompatibleDimensionalityError::new(
                end.len(),
                self.dimensionality(),
            ));
        }
        let ranges: Vec<_> = izip!(self.to_ranges(), end)
            .map(|(range, &end)| range.start.min(end)..range.end.min(end))
            .collect();
        Ok(Self::new_with_ranges(&ranges))
    }

    /// Return the intersection of this array subset with `other`.
    ///
    /// The result is empty if they do not overlap.
    ///
    /// # Errors
    /// Returns [`IncompatibleDimensionalityError`] if the dimensionalities differ.
    pub fn overlap(&self, other: &Self) -> Result<Self, IncompatibleDimensionalityError> {
        if other.dimensionality() != self.dimensionality() {
            return Err(IncompatibleDimensionalityError::new(
                other.dimensionality(),
                self.dimensionality(),
            ));
        }
        let ranges: Vec<_> = izip!(self.to_ranges(), other.to_ranges())
            .map(|(a, b)| {
                let start = a.start.max(b.start);
                start..a.end.min(b.end).max(start)
            })
            .collect();
        Ok(Self::new_with_ranges(&ranges))
    }

    /// Return this array subset relative to `origin`, which must not exceed its start.
    ///
    /// # Errors
    /// Returns [`IncompatibleDimensionalityError`] if the dimensionalities differ.
    pub fn relative_to(&self, origin: &[u64]) -> Result<Self, IncompatibleDimensionalityError> {
        if origin.len() != self.dimensionality() {
            return Err(IncompatibleDimensionalityError::new(
                origin.len(),
                self.dimensionality(),
            ));
        }
        let start = std::iter::zip(&self.start, origin)
            .map(|(start, origin)| start.saturating_sub(*origin))
            .collect();
        Ok(Self {
            start,
            shape: self.shape.clone(),
        })
    }

    /// Returns true if `indices` lie within the array subset.
    #[must_use]
    pub fn contains(&self, indices: &[u64]) -> bool {
        indices.len() == self.dimensionality()
            && izip!(indices, &self.start, &self.shape)
                .all(|(&index, &start, &size)| index >= start && index < start + size)
    }

    /// Returns true if the array subset is within the bounds of `array_shape`.
    #[must_use]
    pub fn inbounds(&self, array_shape: &[u64]) -> bool {
        self.dimensionality() == array_shape.len()
            && izip!(self.start(), self.shape(), array_shape)
                .all(|(start, size, shape)| start + size <= *shape)
    }

    /// Returns an iterator over the indices of elements within the subset, in C order.
    pub fn iter_indices(&self) -> impl Iterator<Item = ArrayIndices> {
        let scalar = self.dimensionality() == 0;
        let product = (!scalar).then(|| self.to_ranges().into_iter().multi_cartesian_product());
        product.into_iter().flatten().chain(scalar.then(Vec::new))
    }

    /// Return the [`ndarray::Slice`] of this array subset along `axis`.
    #[must_use]
    pub fn slice(&self, axis: usize) -> ndarray::Slice {
        let start = to_isize(self.start[axis]);
        let end = to_isize(self.start[axis] + self.shape[axis]);
        ndarray::Slice::from(start..end)
    }
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn to_isize(value: u64) -> isize {
    isize::try_from(value).unwrap_or(isize::MAX)
}

/// An incompatible dimensionality error.
#[derive(Copy, Clone, Debug, Error)]
#[error("incompatible dimensionality {0}, expected {1}")]
pub struct IncompatibleDimensionalityError(usize, usize);

impl IncompatibleDimensionalityError {
    /// Create a new incompatible dimensionality error.
    #[must_use]
    pub const fn new(got: usize, expected: usize) -> Self {
        Self(got, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_subset() {
        assert!(ArraySubset::new_with_start_shape(vec![0, 0], vec![10, 10]).is_ok());
        assert!(ArraySubset::new_with_start_shape(vec![0, 0], vec![10]).is_err());
        let array_subset = ArraySubset::new_with_ranges(&[1..5, 2..4]);
        assert_eq!(array_subset.start(), &[1, 2]);
        assert_eq!(array_subset.shape(), &[4, 2]);
        assert_eq!(array_subset.end_exc(), vec![5, 4]);
        assert_eq!(array_subset.num_elements(), 8);
        assert_eq!(array_subset.to_string(), "start [1, 2] shape [4, 2]");
        assert!(array_subset.contains(&[4, 3]));
        assert!(!array_subset.contains(&[5, 3]));
        assert!(array_subset.inbounds(&[5, 4]));
        assert!(!array_subset.inbounds(&[5, 3]));
    }

    #[test]
    fn array_subset_bound_overlap() {
        let array_subset = ArraySubset::new_with_ranges(&[4..8, 0..4]);
        assert_eq!(
            array_subset.bound(&[6, 10]).unwrap(),
            ArraySubset::new_with_ranges(&[4..6, 0..4])
        );
        assert!(array_subset.bound(&[6]).is_err());

        let other = ArraySubset::new_with_ranges(&[6..12, 2..3]);
        assert_eq!(
            array_subset.overlap(&other).unwrap(),
            ArraySubset::new_with_ranges(&[6..8, 2..3])
        );
        let disjoint = ArraySubset::new_with_ranges(&[0..2, 0..4]);
        assert!(array_subset.overlap(&disjoint).unwrap().is_empty());

        assert_eq!(
            ArraySubset::new_with_ranges(&[6..8, 2..3])
                .relative_to(&[4, 0])
                .unwrap(),
            ArraySubset::new_with_ranges(&[2..4, 2..3])
        );
    }

    #[test]
    fn array_subset_iter_indices() {
        let array_subset = ArraySubset::new_with_ranges(&[1..3, 5..7]);
        let indices: Vec<_> = array_subset.iter_indices().collect();
        assert_eq!(
            indices,
            vec![vec![1, 5], vec![1, 6], vec![2, 5], vec![2, 6]]
        );
        assert_eq!(
            ArraySubset::new_with_ranges(&[1..1, 0..2])
                .iter_indices()
                .count(),
            0
        );
        assert_eq!(ArraySubset::default().iter_indices().count(), 1);
    }
}
