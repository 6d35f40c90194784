use std::collections::HashMap;

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use thiserror::Error;

use super::Coordinate;

/// An invalid [`LabeledArray`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LabeledArrayError {
    /// A dimension name occurs more than once.
    #[error("duplicate dimension {0}")]
    DuplicateDimension(String),
    /// The number of coordinate lists or values axes does not match the number of dimensions.
    #[error("expected {expected} dimensions, got {got}")]
    DimensionalityMismatch {
        /// The number of dimensions.
        expected: usize,
        /// The number of coordinate lists or value axes.
        got: usize,
    },
    /// A dimension's labels do not match the extent of the values.
    #[error("dimension {dimension} has {labels} labels but extent {extent}")]
    ShapeMismatch {
        /// The dimension.
        dimension: String,
        /// The number of labels.
        labels: usize,
        /// The extent of the values along the dimension.
        extent: usize,
    },
    /// A label occurs more than once along a dimension.
    #[error("duplicate coordinate {coordinate} in dimension {dimension}")]
    DuplicateCoordinate {
        /// The dimension.
        dimension: String,
        /// The duplicated label.
        coordinate: Coordinate,
    },
    /// The number of values does not match the labels.
    #[error("expected {expected} values, got {got}")]
    ValueCount {
        /// The product of the number of labels of every dimension.
        expected: usize,
        /// The number of values.
        got: usize,
    },
    /// A dimension name is unknown.
    #[error("unknown dimension {0}")]
    UnknownDimension(String),
    /// Two arrays have different dimensions.
    #[error("dimensions {0:?} do not match {1:?}")]
    DimensionsMismatch(Vec<String>, Vec<String>),
    /// Two arrays have different labels along a dimension.
    #[error("coordinates of dimension {0} differ")]
    CoordinatesMismatch(String),
}

/// An n-dimensional array of `f64` values with named dimensions and coordinate labels.
///
/// `NaN` marks cells without a value.
#[derive(Clone, Debug)]
pub struct LabeledArray {
    dims: Vec<String>,
    coords: Vec<Vec<Coordinate>>,
    values: ArrayD<f64>,
}

impl LabeledArray {
    /// Create a new labeled array.
    ///
    /// # Errors
    /// Returns a [`LabeledArrayError`] if the dimensions are not unique, if the labels of a dimension are not unique,
    /// or if the number of labels of a dimension does not match the extent of `values`.
    pub fn new(
        dims: Vec<String>,
        coords: Vec<Vec<Coordinate>>,
        values: ArrayD<f64>,
    ) -> Result<Self, LabeledArrayError> {
        for (i, dim) in dims.iter().enumerate() {
            if dims[..i].contains(dim) {
                return Err(LabeledArrayError::DuplicateDimension(dim.clone()));
            }
        }
        for got in [coords.len(), values.ndim()] {
            if got != dims.len() {
                return Err(LabeledArrayError::DimensionalityMismatch {
                    expected: dims.len(),
                    got,
                });
            }
        }
        for ((dim, labels), &extent) in dims.iter().zip(&coords).zip(values.shape()) {
            if labels.len() != extent {
                return Err(LabeledArrayError::ShapeMismatch {
                    dimension: dim.clone(),
                    labels: labels.len(),
                    extent,
                });
            }
            let mut sorted: Vec<&Coordinate> = labels.iter().collect();
            sorted.sort();
            if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
                return Err(LabeledArrayError::DuplicateCoordinate {
                    dimension: dim.clone(),
                    coordinate: pair[0].clone(),
                });
            }
        }
        Ok(Self {
            dims,
            coords,
            values,
        })
    }

    /// Create a new labeled array from row-major `values`.
    ///
    /// # Errors
    /// Returns a [`LabeledArrayError`] if `values` does not match the labels, or as for [`LabeledArray::new`].
    pub fn from_shape_vec(
        dims: &[&str],
        coords: Vec<Vec<Coordinate>>,
        values: Vec<f64>,
    ) -> Result<Self, LabeledArrayError> {
        let shape: Vec<usize> = coords.iter().map(Vec::len).collect();
        let expected: usize = shape.iter().product();
        let got = values.len();
        let values = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|_| LabeledArrayError::ValueCount { expected, got })?;
        Self::new(dims.iter().map(ToString::to_string).collect(), coords, values)
    }

    /// Create a labeled array filled with `NaN`.
    ///
    /// # Errors
    /// Returns a [`LabeledArrayError`] as for [`LabeledArray::new`].
    pub fn filled(
        dims: Vec<String>,
        coords: Vec<Vec<Coordinate>>,
    ) -> Result<Self, LabeledArrayError> {
        let shape: Vec<usize> = coords.iter().map(Vec::len).collect();
        let values = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
        Self::new(dims, coords, values)
    }

    /// Return the dimension names.
    #[must_use]
    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    /// Return the labels of every dimension.
    #[must_use]
    pub fn coords(&self) -> &[Vec<Coordinate>] {
        &self.coords
    }

    /// Return the axis of `dim`.
    #[must_use]
    pub fn axis(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    /// Return the labels of `dim`.
    #[must_use]
    pub fn labels(&self, dim: &str) -> Option<&[Coordinate]> {
        self.axis(dim).map(|axis| self.coords[axis].as_slice())
    }

    /// Return the values.
    #[must_use]
    pub fn values(&self) -> &ArrayD<f64> {
        &self.values
    }

    /// Return the shape of the values.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    /// Return the number of labels along `dim`.
    #[must_use]
    pub fn len_of(&self, dim: &str) -> Option<usize> {
        self.axis(dim).map(|axis| self.coords[axis].len())
    }

    /// Returns true if the array has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Decompose into dimensions, labels and values.
    #[must_use]
    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Coordinate>>, ArrayD<f64>) {
        (self.dims, self.coords, self.values)
    }

    /// Return the value at the given label of every dimension.
    #[must_use]
    pub fn get(&self, labels: &[Coordinate]) -> Option<f64> {
        if labels.len() != self.dims.len() {
            return None;
        }
        let index = std::iter::zip(&self.coords, labels)
            .map(|(coords, label)| coords.iter().position(|c| c == label))
            .collect::<Option<Vec<usize>>>()?;
        self.values.get(index.as_slice()).copied()
    }

    /// Return the array with the labels of every dimension in ascending order.
    #[must_use]
    pub fn sorted(mut self) -> Self {
        for axis in 0..self.dims.len() {
            let labels = &self.coords[axis];
            if labels.windows(2).all(|pair| pair[0] < pair[1]) {
                continue;
            }
            let mut order: Vec<usize> = (0..labels.len()).collect();
            order.sort_by(|&a, &b| labels[a].cmp(&labels[b]));
            self = self.select(axis, &order);
        }
        self
    }

    /// Return the elements at `positions` along `axis`, in the order given.
    #[must_use]
    pub fn select(&self, axis: usize, positions: &[usize]) -> Self {
        let mut coords = self.coords.clone();
        coords[axis] = positions
            .iter()
            .map(|&position| self.coords[axis][position].clone())
            .collect();
        Self {
            dims: self.dims.clone(),
            coords,
            values: self.values.select(Axis(axis), positions),
        }
    }

    /// Return the array with `labels` along `dim`.
    ///
    /// Values of labels the array has are kept, labels it lacks are filled with `NaN` and labels
    /// not in `labels` are dropped.
    ///
    /// # Errors
    /// Returns [`LabeledArrayError::UnknownDimension`] if the array has no dimension `dim`,
    /// or [`LabeledArrayError::DuplicateCoordinate`] if `labels` are not unique.
    pub fn reindexed(&self, dim: &str, labels: &[Coordinate]) -> Result<Self, LabeledArrayError> {
        let axis = self
            .axis(dim)
            .ok_or_else(|| LabeledArrayError::UnknownDimension(dim.to_string()))?;
        let mut coords = self.coords.clone();
        coords[axis] = labels.to_vec();
        let mut reindexed = Self::filled(self.dims.clone(), coords)?;
        let sources: HashMap<&Coordinate, usize> = self.coords[axis]
            .iter()
            .enumerate()
            .map(|(position, label)| (label, position))
            .collect();
        for (target, label) in labels.iter().enumerate() {
            if let Some(&source) = sources.get(label) {
                reindexed
                    .values
                    .index_axis_mut(Axis(axis), target)
                    .assign(&self.values.index_axis(Axis(axis), source));
            }
        }
        Ok(reindexed)
    }

    /// Return the array with its dimensions in the order of `dims`.
    ///
    /// # Errors
    /// Returns [`LabeledArrayError::DimensionsMismatch`] if `dims` is not a permutation of the array's dimensions.
    pub fn transposed(self, dims: &[String]) -> Result<Self, LabeledArrayError> {
        if self.dims == dims {
            return Ok(self);
        }
        let mismatch = || LabeledArrayError::DimensionsMismatch(self.dims.clone(), dims.to_vec());
        if dims.len() != self.dims.len() {
            return Err(mismatch());
        }
        let permutation = dims
            .iter()
            .map(|dim| self.axis(dim))
            .collect::<Option<Vec<usize>>>()
            .ok_or_else(mismatch)?;
        let coords = permutation
            .iter()
            .map(|&axis| self.coords[axis].clone())
            .collect();
        let values = self
            .values
            .permuted_axes(IxDyn(&permutation))
            .as_standard_layout()
            .into_owned();
        Ok(Self {
            dims: dims.to_vec(),
            coords,
            values,
        })
    }

    /// Concatenate `arrays` along `dim`.
    ///
    /// Every array must have the same dimensions and identical labels along every other dimension.
    ///
    /// # Errors
    /// Returns a [`LabeledArrayError`] if the arrays are incompatible or `arrays` is empty.
    pub fn concatenate(dim: &str, arrays: &[Self]) -> Result<Self, LabeledArrayError> {
        let first = arrays
            .first()
            .ok_or_else(|| LabeledArrayError::UnknownDimension(dim.to_string()))?;
        let axis = first
            .axis(dim)
            .ok_or_else(|| LabeledArrayError::UnknownDimension(dim.to_string()))?;
        for array in &arrays[1..] {
            if array.dims != first.dims {
                return Err(LabeledArrayError::DimensionsMismatch(
                    first.dims.clone(),
                    array.dims.clone(),
                ));
            }
            for (other, (a, b)) in first.coords.iter().zip(&array.coords).enumerate() {
                if other != axis && a != b {
                    return Err(LabeledArrayError::CoordinatesMismatch(
                        first.dims[other].clone(),
                    ));
                }
            }
        }
        let mut coords = first.coords.clone();
        coords[axis] = arrays
            .iter()
            .flat_map(|array| array.coords[axis].iter().cloned())
            .collect();
        let views: Vec<ArrayViewD<f64>> = arrays.iter().map(|array| array.values.view()).collect();
        let values = ndarray::concatenate(Axis(axis), &views).map_err(|_| {
            LabeledArrayError::CoordinatesMismatch(dim.to_string())
        })?;
        Self::new(first.dims.clone(), coords, values)
    }

    /// Returns true if both arrays have the same dimensions, labels and values, treating `NaN` as equal to `NaN`.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        self.dims == other.dims
            && self.coords == other.coords
            && self.values.shape() == other.values.shape()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
    }
}

#[cfg(test)]
mod tests {
    use crate::tensor::coordinates;

    use super::*;

    #[test]
    fn labeled_array_validation() {
        assert!(LabeledArray::from_shape_vec(
            &["time", "asset"],
            vec![coordinates([0, 1]), coordinates(["a", "b", "c"])],
            (0..6).map(f64::from).collect(),
        )
        .is_ok());
        assert_eq!(
            LabeledArray::from_shape_vec(
                &["time", "time"],
                vec![coordinates([0]), coordinates([1])],
                vec![0.0],
            )
            .unwrap_err(),
            LabeledArrayError::DuplicateDimension("time".to_string())
        );
        assert!(matches!(
            LabeledArray::from_shape_vec(&["time"], vec![coordinates([0, 0])], vec![0.0, 1.0]),
            Err(LabeledArrayError::DuplicateCoordinate { .. })
        ));
        assert!(LabeledArray::from_shape_vec(&["time"], vec![coordinates([0, 1])], vec![0.0])
            .is_err());
    }

    #[test]
    fn labeled_array_sorted() {
        let array = LabeledArray::from_shape_vec(
            &["time", "asset"],
            vec![coordinates([2, 0, 1]), coordinates(["b", "a"])],
            vec![20.0, 21.0, 0.0, 1.0, 10.0, 11.0],
        )
        .unwrap()
        .sorted();
        assert_eq!(array.coords()[0], coordinates([0, 1, 2]));
        assert_eq!(array.coords()[1], coordinates(["a", "b"]));
        assert_eq!(
            array.values().iter().copied().collect::<Vec<_>>(),
            vec![1.0, 0.0, 11.0, 10.0, 21.0, 20.0]
        );
        assert_eq!(
            array.get(&[Coordinate::Int(2), Coordinate::from("b")]),
            Some(20.0)
        );
    }

    #[test]
    fn labeled_array_transposed() {
        let array = LabeledArray::from_shape_vec(
            &["time", "asset"],
            vec![coordinates([0, 1]), coordinates(["a", "b", "c"])],
            (0..6).map(f64::from).collect(),
        )
        .unwrap();
        let transposed = array
            .clone()
            .transposed(&["asset".to_string(), "time".to_string()])
            .unwrap();
        assert_eq!(transposed.shape(), &[3, 2]);
        assert_eq!(
            transposed.get(&[Coordinate::from("c"), Coordinate::Int(0)]),
            array.get(&[Coordinate::Int(0), Coordinate::from("c")])
        );
        assert!(array.transposed(&["asset".to_string()]).is_err());
    }

    #[test]
    fn labeled_array_reindexed() {
        let array = LabeledArray::from_shape_vec(
            &["time", "asset"],
            vec![coordinates([0, 1]), coordinates(["a", "c", "d"])],
            (0..6).map(f64::from).collect(),
        )
        .unwrap();
        let reindexed = array
            .reindexed("asset", &coordinates(["a", "b", "c"]))
            .unwrap();
        assert_eq!(reindexed.coords()[1], coordinates(["a", "b", "c"]));
        assert_eq!(
            reindexed.get(&[Coordinate::Int(1), Coordinate::from("c")]),
            Some(4.0)
        );
        assert!(reindexed
            .get(&[Coordinate::Int(0), Coordinate::from("b")])
            .unwrap()
            .is_nan());
        assert!(reindexed
            .get(&[Coordinate::Int(0), Coordinate::from("d")])
            .is_none());
        assert_eq!(
            array.reindexed("venue", &[]).unwrap_err(),
            LabeledArrayError::UnknownDimension("venue".to_string())
        );
    }

    #[test]
    fn labeled_array_concatenate() {
        let a = LabeledArray::from_shape_vec(
            &["time", "asset"],
            vec![coordinates([0]), coordinates(["a", "b"])],
            vec![0.0, 1.0],
        )
        .unwrap();
        let b = LabeledArray::from_shape_vec(
            &["time", "asset"],
            vec![coordinates([1, 2]), coordinates(["a", "b"])],
            vec![2.0, 3.0, 4.0, f64::NAN],
        )
        .unwrap();
        let c = LabeledArray::concatenate("time", &[a.clone(), b]).unwrap();
        assert_eq!(c.coords()[0], coordinates([0, 1, 2]));
        let expected = LabeledArray::from_shape_vec(
            &["time", "asset"],
            vec![coordinates([0, 1, 2]), coordinates(["a", "b"])],
            vec![0.0, 1.0, 2.0, 3.0, 4.0, f64::NAN],
        )
        .unwrap();
        assert!(c.equals(&expected));

        let d = LabeledArray::from_shape_vec(
            &["time", "asset"],
            vec![coordinates([1]), coordinates(["a", "z"])],
            vec![0.0, 1.0],
        )
        .unwrap();
        assert_eq!(
            LabeledArray::concatenate("time", &[a, d]).unwrap_err(),
            LabeledArrayError::CoordinatesMismatch("asset".to_string())
        );
    }
}
