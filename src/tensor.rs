//! Tensors.
//!
//! A tensor is a labeled n-dimensional array of `f64` values:
//!  - a [`TensorDescriptor`] names its dimensions and their chunk sizes,
//!  - a [`CoordinateIndex`] per dimension maps [`Coordinate`] labels to positions, and
//!  - a [`LabeledArray`] carries data with its labels to and from storage.
//!
//! Every tensor operation fails with a [`TensorError`].

mod coordinate;
mod labeled_array;
mod tensor_descriptor;
mod tensor_errors;

pub use coordinate::{coordinates, Coordinate, CoordinateIndex, IndexMerge};
pub use labeled_array::{LabeledArray, LabeledArrayError};
pub use tensor_descriptor::{Attributes, TensorDescriptor};
pub use tensor_errors::{TensorContext, TensorError, TensorOperation};
