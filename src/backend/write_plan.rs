//! Validation of logical writes against a stored layout.
//!
//! Every backend plans a write the same way: normalise the incoming data to the stored dimension order,
//! check its labels against the coordinate index, and derive the layout after the write together with
//! the position of every incoming label.

use ndarray::{ArrayD, IxDyn};

use crate::{
    array_subset::ArrayShape,
    tensor::{
        CoordinateIndex, IndexMerge, LabeledArray, TensorContext, TensorDescriptor, TensorError,
    },
};

use super::{Selection, TensorLayout};

/// A validated write.
#[derive(Clone, Debug)]
pub(crate) struct WritePlan {
    /// The layout after the write.
    pub(crate) layout: TensorLayout,
    /// The shape before the write, [`None`] if the write replaces the tensor.
    pub(crate) old_shape: Option<ArrayShape>,
    /// The position of every label of the data in `layout`, per dimension.
    pub(crate) positions: Vec<Vec<u64>>,
    /// The new position of every stored label, per dimension, if the index was reordered.
    pub(crate) relocation: Option<Vec<Vec<u64>>>,
}

impl WritePlan {
    /// Returns true if the write changes the layout.
    pub(crate) fn changes_layout(&self, layout: &TensorLayout) -> bool {
        self.old_shape.is_none() || self.layout.coords() != layout.coords()
    }
}

/// Transpose `data` to `dims` and sort its labels.
pub(crate) fn align(
    ctx: TensorContext<'_>,
    data: LabeledArray,
    dims: &[String],
) -> Result<LabeledArray, TensorError> {
    Ok(data
        .transposed(dims)
        .map_err(|err| ctx.dimension_mismatch(err))?
        .sorted())
}

/// Plan the creation of a tensor from aligned `data`.
pub(crate) fn plan_store(
    ctx: TensorContext<'_>,
    descriptor: &TensorDescriptor,
    data: &LabeledArray,
) -> Result<WritePlan, TensorError> {
    let coords = data
        .coords()
        .iter()
        .map(|labels| CoordinateIndex::try_from(labels.clone()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ctx.dimension_mismatch(err))?;
    let positions = data
        .coords()
        .iter()
        .map(|labels| (0..labels.len() as u64).collect())
        .collect();
    Ok(WritePlan {
        layout: TensorLayout::new(descriptor, coords),
        old_shape: None,
        positions,
        relocation: None,
    })
}

/// Plan appending aligned `data` along `dimension`.
pub(crate) fn plan_append(
    ctx: TensorContext<'_>,
    layout: &TensorLayout,
    data: &LabeledArray,
    dimension: &str,
) -> Result<WritePlan, TensorError> {
    let axis = layout
        .axis(dimension)
        .ok_or_else(|| ctx.dimension_mismatch(format!("unknown dimension {dimension}")))?;
    let index = &layout.coords()[axis];
    let labels = &data.coords()[axis];
    index
        .check_contiguous(labels, layout.steps()[axis])
        .map_err(|coordinate| ctx.index_conflict(dimension, coordinate))?;

    let mut positions = existing_positions(ctx, layout, data, Some(axis))?;
    let start = index.len() as u64;
    positions[axis] = (start..start + labels.len() as u64).collect();
    let mut new_layout = layout.clone();
    new_layout.coords_mut()[axis].extend(labels);
    Ok(WritePlan {
        layout: new_layout,
        old_shape: Some(layout.shape()),
        positions,
        relocation: None,
    })
}

/// Plan replacing values of aligned `data` in place.
pub(crate) fn plan_update(
    ctx: TensorContext<'_>,
    layout: &TensorLayout,
    data: &LabeledArray,
) -> Result<WritePlan, TensorError> {
    Ok(WritePlan {
        layout: layout.clone(),
        old_shape: Some(layout.shape()),
        positions: existing_positions(ctx, layout, data, None)?,
        relocation: None,
    })
}

/// Plan inserting or replacing values of aligned `data`.
pub(crate) fn plan_upsert(
    ctx: TensorContext<'_>,
    layout: &TensorLayout,
    data: &LabeledArray,
) -> Result<WritePlan, TensorError> {
    let mut new_layout = layout.clone();
    let mut reordered = false;
    for (index, labels) in new_layout.coords_mut().iter_mut().zip(data.coords()) {
        match index.merge(labels) {
            IndexMerge::Unchanged => {}
            IndexMerge::Extended(merged) => *index = merged,
            IndexMerge::Reordered(merged) => {
                *index = merged;
                reordered = true;
            }
        }
    }
    let positions = existing_positions(ctx, &new_layout, data, None)?;
    let relocation = if reordered {
        Some(
            itertools::izip!(layout.dims(), layout.coords(), new_layout.coords())
                .map(|(dim, old, new)| {
                    new.positions(old.labels())
                        .map_err(|coordinate| ctx.index_conflict(dim, coordinate))
                })
                .collect::<Result<Vec<_>, _>>()?,
        )
    } else {
        None
    };
    Ok(WritePlan {
        layout: new_layout,
        old_shape: Some(layout.shape()),
        positions,
        relocation,
    })
}

/// Plan removing the labels of `selection`.
///
/// Returns the layout without the labels and the position in `layout` of every kept label, per dimension.
pub(crate) fn plan_drop(
    ctx: TensorContext<'_>,
    layout: &TensorLayout,
    selection: &Selection,
) -> Result<(TensorLayout, Vec<Vec<u64>>), TensorError> {
    if let Some(dim) = selection.dims().find(|dim| layout.axis(dim).is_none()) {
        return Err(ctx.dimension_mismatch(format!("unknown dimension {dim}")));
    }
    let mut new_layout = layout.clone();
    let mut kept = Vec::with_capacity(layout.dims().len());
    for (dim, index) in std::iter::zip(layout.dims(), new_layout.coords_mut()) {
        let dropped = match selection.labels(dim) {
            Some(labels) => index
                .positions(labels)
                .map_err(|coordinate| ctx.index_conflict(dim, coordinate))?,
            None => vec![],
        };
        let positions: Vec<u64> = (0..index.len() as u64)
            .filter(|position| !dropped.contains(position))
            .collect();
        let labels = positions
            .iter()
            .map(|&position| index.labels()[position as usize].clone())
            .collect();
        *index = CoordinateIndex::new(labels).map_err(|coordinate| ctx.index_conflict(dim, coordinate))?;
        kept.push(positions);
    }
    Ok((new_layout, kept))
}

/// Resolve the positions of a selection, every label of a dimension if it is not selected.
pub(crate) fn plan_read(
    ctx: TensorContext<'_>,
    layout: &TensorLayout,
    selection: &Selection,
) -> Result<Vec<Vec<u64>>, TensorError> {
    if let Some(dim) = selection.dims().find(|dim| layout.axis(dim).is_none()) {
        return Err(ctx.dimension_mismatch(format!("unknown dimension {dim}")));
    }
    std::iter::zip(layout.dims(), layout.coords())
        .map(|(dim, index)| match selection.labels(dim) {
            Some(labels) => index
                .positions(labels)
                .map_err(|coordinate| ctx.index_conflict(dim, coordinate)),
            None => Ok((0..index.len() as u64).collect()),
        })
        .collect()
}

/// Resolve the positions of the labels of `data` which must exist, skipping `skip_axis`.
fn existing_positions(
    ctx: TensorContext<'_>,
    layout: &TensorLayout,
    data: &LabeledArray,
    skip_axis: Option<usize>,
) -> Result<Vec<Vec<u64>>, TensorError> {
    itertools::izip!(layout.dims(), layout.coords(), data.coords())
        .enumerate()
        .map(|(axis, (dim, index, labels))| {
            if Some(axis) == skip_axis {
                Ok(vec![])
            } else {
                index
                    .positions(labels)
                    .map_err(|coordinate| ctx.index_conflict(dim, coordinate))
            }
        })
        .collect()
}

/// Write every value of `values` into `target` at the per-dimension `positions`.
pub(crate) fn scatter(target: &mut ArrayD<f64>, positions: &[Vec<u64>], values: &ArrayD<f64>) {
    let mut index = vec![0usize; positions.len()];
    for (source, &value) in values.indexed_iter() {
        for (axis, target_index) in index.iter_mut().enumerate() {
            *target_index = positions[axis][source[axis]] as usize;
        }
        target[IxDyn(&index)] = value;
    }
}

/// Read the values of `source` at the per-dimension `positions`.
pub(crate) fn gather(source: &ArrayD<f64>, positions: &[Vec<u64>]) -> ArrayD<f64> {
    let shape: Vec<usize> = positions.iter().map(Vec::len).collect();
    let mut index = vec![0usize; positions.len()];
    ArrayD::from_shape_fn(IxDyn(&shape), |target| {
        for (axis, source_index) in index.iter_mut().enumerate() {
            *source_index = positions[axis][target[axis]] as usize;
        }
        source[IxDyn(&index)]
    })
}

/// The shape of `layout` as `usize`.
pub(crate) fn shape_usize(shape: &[u64]) -> Vec<usize> {
    shape.iter().map(|&extent| extent as usize).collect()
}
