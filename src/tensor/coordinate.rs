use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::chunk_geometry::{classify_ranges, RangeRelation};

/// A coordinate label, e.g. a timestamp, an integer position or a name.
///
/// Integer labels order before string labels.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[serde(untagged)]
pub enum Coordinate {
    /// An integer label.
    Int(i64),
    /// A string label.
    Str(String),
}

impl From<&str> for Coordinate {
    fn from(label: &str) -> Self {
        Self::Str(label.to_string())
    }
}

impl From<i32> for Coordinate {
    fn from(label: i32) -> Self {
        Self::Int(label.into())
    }
}

/// Convert a list of labels into [`Coordinate`]s.
pub fn coordinates<T: Into<Coordinate>>(labels: impl IntoIterator<Item = T>) -> Vec<Coordinate> {
    labels.into_iter().map(Into::into).collect()
}

/// The ordered coordinate labels of one dimension of a stored tensor.
///
/// Labels are unique and ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Coordinate>", into = "Vec<Coordinate>")]
pub struct CoordinateIndex(Vec<Coordinate>);

/// The outcome of merging new labels into a [`CoordinateIndex`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexMerge {
    /// Every label is already in the index.
    Unchanged,
    /// The new labels all sort after the index and are appended at its end.
    Extended(CoordinateIndex),
    /// Some new labels sort inside the index, stored positions shift.
    Reordered(CoordinateIndex),
}

impl CoordinateIndex {
    /// Create an index from `labels`, sorting them.
    ///
    /// Returns the first duplicated label as an error.
    pub fn new(mut labels: Vec<Coordinate>) -> Result<Self, Coordinate> {
        labels.sort();
        if let Some(duplicate) = labels
            .windows(2)
            .find(|pair| pair[0] == pair[1])
            .map(|pair| pair[0].clone())
        {
            return Err(duplicate);
        }
        Ok(Self(labels))
    }

    /// Return the labels.
    #[must_use]
    pub fn labels(&self) -> &[Coordinate] {
        &self.0
    }

    /// Return the number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return the last (greatest) label.
    #[must_use]
    pub fn last(&self) -> Option<&Coordinate> {
        self.0.last()
    }

    /// Return the position of `label`.
    #[must_use]
    pub fn position(&self, label: &Coordinate) -> Option<u64> {
        self.0.binary_search(label).ok().map(|position| position as u64)
    }

    /// Return the positions of every label in `labels`.
    ///
    /// Returns the first label absent from the index as an error.
    pub fn positions(&self, labels: &[Coordinate]) -> Result<Vec<u64>, Coordinate> {
        labels
            .iter()
            .map(|label| self.position(label).ok_or_else(|| label.clone()))
            .collect()
    }

    /// Check that ascending `labels` continue the index without a gap.
    ///
    /// Integer labels must step by `step` from the last label and between each other.
    /// Other labels only need to sort after the last label.
    /// Returns the first offending label as an error.
    pub fn check_contiguous(&self, labels: &[Coordinate], step: i64) -> Result<(), Coordinate> {
        let Some(first) = labels.first() else {
            return Ok(());
        };
        if let Some(last) = self.last() {
            if first <= last || relation(last, first, step) != Some(RangeRelation::Contiguous) {
                return Err(first.clone());
            }
        }
        for pair in labels.windows(2) {
            if pair[1] <= pair[0]
                || relation(&pair[0], &pair[1], step) != Some(RangeRelation::Contiguous)
            {
                return Err(pair[1].clone());
            }
        }
        Ok(())
    }

    /// Append ascending `labels` which sort after every label in the index.
    pub(crate) fn extend(&mut self, labels: &[Coordinate]) {
        self.0.extend_from_slice(labels);
    }

    /// Merge `labels` into the index.
    #[must_use]
    pub fn merge(&self, labels: &[Coordinate]) -> IndexMerge {
        let mut new_labels: Vec<Coordinate> = labels
            .iter()
            .filter(|label| self.position(label).is_none())
            .cloned()
            .collect();
        if new_labels.is_empty() {
            return IndexMerge::Unchanged;
        }
        new_labels.sort();
        new_labels.dedup();
        let after = match (self.last(), new_labels.first()) {
            (Some(last), Some(first)) => first > last,
            _ => true,
        };
        let mut merged = self.0.clone();
        merged.extend(new_labels);
        if after {
            IndexMerge::Extended(Self(merged))
        } else {
            merged.sort();
            IndexMerge::Reordered(Self(merged))
        }
    }
}

impl TryFrom<Vec<Coordinate>> for CoordinateIndex {
    type Error = String;

    fn try_from(labels: Vec<Coordinate>) -> Result<Self, Self::Error> {
        match labels.windows(2).find(|pair| pair[0] >= pair[1]) {
            Some(pair) => Err(format!("coordinate {} is not ascending", pair[1])),
            None => Ok(Self(labels)),
        }
    }
}

impl From<CoordinateIndex> for Vec<Coordinate> {
    fn from(index: CoordinateIndex) -> Self {
        index.0
    }
}

/// The relation between the unit range starting at `last` and the one starting at `next`.
///
/// Non-integer labels cannot be stepped, so any ascending pair is contiguous.
fn relation(last: &Coordinate, next: &Coordinate, step: i64) -> Option<RangeRelation> {
    match (last, next) {
        (Coordinate::Int(last), Coordinate::Int(next)) => {
            let step = u64::try_from(step).ok().filter(|&step| step > 0)?;
            let offset = u64::try_from(i128::from(*next) - i128::from(*last)).ok()?;
            classify_ranges(&(0..step), &(offset..offset.checked_add(step)?)).ok()
        }
        _ => Some(RangeRelation::Contiguous),
    }
}
