use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Axis, IxDyn};
use parking_lot::RwLock;

use crate::{
    array_subset::{ArrayIndices, ArraySubset},
    backup::BackupRecord,
    chunk_geometry::ChunkGeometry,
    storage::Bytes,
    tensor::{
        Attributes, LabeledArray, TensorContext, TensorDescriptor, TensorError, TensorOperation,
    },
};

use super::{
    array_metadata::{chunk_key_name, decode_chunk, encode_chunk, RESERVED_ATTRIBUTES},
    write_plan::{
        align, gather, plan_append, plan_drop, plan_read, plan_store, plan_update, plan_upsert,
        scatter,
        shape_usize, WritePlan,
    },
    Selection, TensorLayout, TensorStorage,
};

/// A tensor held in memory as a dense array.
///
/// Chunks are views of the dense array. A chunk exists once a write touched it.
/// Intended for tests and as a backup destination that does not outlive the process.
pub struct MemoryTensorStorage {
    descriptor: TensorDescriptor,
    geometry: ChunkGeometry,
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    tensor: Option<MemoryTensor>,
    /// Chunks written through `store_encoded_chunk`, kept verbatim until a logical write.
    encoded: BTreeMap<ArrayIndices, ArrayD<f64>>,
}

struct MemoryTensor {
    layout: TensorLayout,
    record: Option<BackupRecord>,
    values: ArrayD<f64>,
    chunks: BTreeSet<ArrayIndices>,
}

impl MemoryTensorStorage {
    /// Create an empty in-memory tensor described by `descriptor`.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if the chunk shape of `descriptor` is invalid.
    pub fn new(descriptor: TensorDescriptor) -> Result<Self, TensorError> {
        let geometry = ChunkGeometry::new(descriptor.chunks())?;
        Ok(Self {
            descriptor,
            geometry,
            state: RwLock::default(),
        })
    }

    fn ctx(&self, operation: TensorOperation) -> TensorContext<'_> {
        TensorContext::new(self.descriptor.id(), operation)
    }

    /// Return the chunk subset of `chunk_indices`, or [`None`] if it lies outside `shape`.
    fn chunk_subset(&self, chunk_indices: &[u64], shape: &[u64]) -> Option<ArraySubset> {
        self.geometry
            .chunk_subset(chunk_indices, shape)
            .ok()
            .filter(|subset| !subset.is_empty())
    }

    fn touched_chunks(&self, positions: &[Vec<u64>]) -> Vec<ArrayIndices> {
        if positions.iter().any(Vec::is_empty) {
            return vec![];
        }
        std::iter::zip(positions, self.descriptor.chunks())
            .map(|(positions, &size)| {
                positions
                    .iter()
                    .map(|position| position / size)
                    .sorted()
                    .dedup()
                    .collect_vec()
            })
            .multi_cartesian_product()
            .collect()
    }

    fn all_chunks(&self, shape: &[u64]) -> Vec<ArrayIndices> {
        let positions: Vec<Vec<u64>> = shape.iter().map(|&extent| (0..extent).collect()).collect();
        self.touched_chunks(&positions)
    }

    /// Copy the part of `chunk` within the tensor into its values.
    fn write_chunk_values(&self, tensor: &mut MemoryTensor, chunk_indices: &[u64], chunk: &ArrayD<f64>) {
        let shape = tensor.layout.shape();
        if let Some(subset) = self.chunk_subset(chunk_indices, &shape) {
            let local = ArraySubset::new_with_shape(subset.shape().to_vec());
            subview_mut(&mut tensor.values, &subset).assign(&subview(chunk, &local));
        }
    }

    fn apply(&self, state: &mut MemoryState, plan: WritePlan, values: &ArrayD<f64>) {
        let Some(tensor) = state.tensor.as_mut() else {
            return;
        };
        let shape = plan.layout.shape();
        if let Some(relocation) = &plan.relocation {
            let mut merged = ArrayD::from_elem(IxDyn(&shape_usize(&shape)), f64::NAN);
            scatter(&mut merged, relocation, &tensor.values);
            tensor.values = merged;
            tensor.chunks = self.all_chunks(&shape).into_iter().collect();
        } else if shape != tensor.layout.shape() {
            let old: Vec<Vec<u64>> = tensor
                .values
                .shape()
                .iter()
                .map(|&extent| (0..extent as u64).collect())
                .collect();
            let mut grown = ArrayD::from_elem(IxDyn(&shape_usize(&shape)), f64::NAN);
            scatter(&mut grown, &old, &tensor.values);
            tensor.values = grown;
        }
        scatter(&mut tensor.values, &plan.positions, values);
        tensor.chunks.extend(self.touched_chunks(&plan.positions));
        tensor.chunks.extend(std::mem::take(&mut state.encoded).into_keys());
        tensor.layout = plan.layout;
        tensor.record = None;
    }

    fn store_data(
        &self,
        ctx: TensorContext<'_>,
        state: &mut MemoryState,
        data: LabeledArray,
    ) -> Result<(), TensorError> {
        let plan = plan_store(ctx, &self.descriptor, &data)?;
        let chunks = self.all_chunks(&plan.layout.shape()).into_iter().collect();
        let (_, _, values) = data.into_parts();
        state.tensor = Some(MemoryTensor {
            layout: plan.layout,
            record: None,
            values,
            chunks,
        });
        state.encoded.clear();
        Ok(())
    }
}

fn subview<'a>(array: &'a ArrayD<f64>, subset: &ArraySubset) -> ArrayViewD<'a, f64> {
    let mut view = array.view();
    for axis in 0..subset.dimensionality() {
        view.slice_axis_inplace(Axis(axis), subset.slice(axis));
    }
    view
}

fn subview_mut<'a>(array: &'a mut ArrayD<f64>, subset: &ArraySubset) -> ArrayViewMutD<'a, f64> {
    let mut view = array.view_mut();
    for axis in 0..subset.dimensionality() {
        view.slice_axis_inplace(Axis(axis), subset.slice(axis));
    }
    view
}

impl TensorStorage for MemoryTensorStorage {
    fn tensor_id(&self) -> &str {
        self.descriptor.id()
    }

    fn exists(&self) -> Result<bool, TensorError> {
        Ok(self.state.read().tensor.is_some())
    }

    fn attributes(&self) -> Result<Attributes, TensorError> {
        let ctx = self.ctx(TensorOperation::GetAttributes);
        let state = self.state.read();
        let tensor = state.tensor.as_ref().ok_or_else(|| ctx.not_found())?;
        Ok(tensor.layout.attributes().clone())
    }

    fn set_attributes(&self, attributes: Attributes, overwrite: bool) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::SetAttributes);
        if let Some(name) = attributes
            .keys()
            .find(|name| RESERVED_ATTRIBUTES.contains(&name.as_str()))
        {
            return Err(TensorError::Configuration(format!(
                "attribute {name} is reserved"
            )));
        }
        let mut state = self.state.write();
        let tensor = state.tensor.as_mut().ok_or_else(|| ctx.not_found())?;
        if overwrite {
            tensor.layout.set_attributes(attributes);
        } else {
            let mut merged = tensor.layout.attributes().clone();
            merged.extend(attributes);
            tensor.layout.set_attributes(merged);
        }
        Ok(())
    }

    fn store(&self, data: LabeledArray, overwrite: bool) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Store);
        let data = align(ctx, data, self.descriptor.dims())?;
        let mut state = self.state.write();
        if state.tensor.is_some() && !overwrite {
            return Err(ctx.already_exists());
        }
        self.store_data(ctx, &mut state, data)
    }

    fn append(&self, data: LabeledArray, dimension: &str) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Append);
        let data = align(ctx, data, self.descriptor.dims())?;
        let mut state = self.state.write();
        let Some(tensor) = &state.tensor else {
            return self.store_data(ctx, &mut state, data);
        };
        let plan = plan_append(ctx, &tensor.layout, &data, dimension)?;
        self.apply(&mut state, plan, data.values());
        Ok(())
    }

    fn update(&self, data: LabeledArray) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Update);
        let data = align(ctx, data, self.descriptor.dims())?;
        let mut state = self.state.write();
        let tensor = state.tensor.as_ref().ok_or_else(|| ctx.not_found())?;
        let plan = plan_update(ctx, &tensor.layout, &data)?;
        self.apply(&mut state, plan, data.values());
        Ok(())
    }

    fn upsert(&self, data: LabeledArray) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Upsert);
        let data = align(ctx, data, self.descriptor.dims())?;
        let mut state = self.state.write();
        let Some(tensor) = &state.tensor else {
            return self.store_data(ctx, &mut state, data);
        };
        let plan = plan_upsert(ctx, &tensor.layout, &data)?;
        self.apply(&mut state, plan, data.values());
        Ok(())
    }

    fn drop_labels(&self, selection: &Selection) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::DropLabels);
        let mut state = self.state.write();
        let tensor = state.tensor.as_mut().ok_or_else(|| ctx.not_found())?;
        let (layout, kept) = plan_drop(ctx, &tensor.layout, selection)?;
        if layout.coords() == tensor.layout.coords() {
            return Ok(());
        }
        tensor.values = gather(&tensor.values, &kept);
        tensor.chunks = self.all_chunks(&layout.shape()).into_iter().collect();
        tensor.layout = layout;
        tensor.record = None;
        state.encoded.clear();
        Ok(())
    }

    fn read_selection(&self, selection: &Selection) -> Result<LabeledArray, TensorError> {
        let ctx = self.ctx(TensorOperation::Read);
        let state = self.state.read();
        let tensor = state.tensor.as_ref().ok_or_else(|| ctx.not_found())?;
        let positions = plan_read(ctx, &tensor.layout, selection)?;
        let coords = std::iter::zip(tensor.layout.coords(), &positions)
            .map(|(index, positions)| {
                positions
                    .iter()
                    .map(|&position| index.labels()[position as usize].clone())
                    .collect()
            })
            .collect();
        LabeledArray::new(
            tensor.layout.dims().to_vec(),
            coords,
            gather(&tensor.values, &positions),
        )
        .map_err(|err| ctx.dimension_mismatch(err))
    }

    fn delete_file(&self, _only_local: bool) -> Result<(), TensorError> {
        *self.state.write() = MemoryState::default();
        Ok(())
    }

    fn close(&self) -> Result<(), TensorError> {
        Ok(())
    }

    fn layout_and_record(
        &self,
    ) -> Result<Option<(TensorLayout, Option<BackupRecord>)>, TensorError> {
        Ok(self
            .state
            .read()
            .tensor
            .as_ref()
            .map(|tensor| (tensor.layout.clone(), tensor.record.clone())))
    }

    fn write_layout(
        &self,
        layout: &TensorLayout,
        record: Option<&BackupRecord>,
    ) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Chunk);
        if layout.dims() != self.descriptor.dims() || layout.chunks() != self.descriptor.chunks() {
            return Err(ctx.dimension_mismatch(format!(
                "layout dimensions {:?} do not match {:?}",
                layout.dims(),
                self.descriptor.dims()
            )));
        }
        let mut state = self.state.write();
        let shape = layout.shape();
        let mut values = ArrayD::from_elem(IxDyn(&shape_usize(&shape)), f64::NAN);
        let mut chunks = BTreeSet::new();
        if let Some(tensor) = state.tensor.take() {
            let common: Vec<u64> = std::iter::zip(tensor.values.shape(), &shape)
                .map(|(&old, &new)| (old as u64).min(new))
                .collect();
            let common = ArraySubset::new_with_shape(common);
            subview_mut(&mut values, &common).assign(&subview(&tensor.values, &common));
            chunks = tensor
                .chunks
                .into_iter()
                .filter(|chunk| self.chunk_subset(chunk, &shape).is_some())
                .collect();
        }
        let mut tensor = MemoryTensor {
            layout: layout.clone(),
            record: record.cloned(),
            values,
            chunks,
        };
        for (chunk_indices, chunk) in &state.encoded {
            self.write_chunk_values(&mut tensor, chunk_indices, chunk);
        }
        state.tensor = Some(tensor);
        Ok(())
    }

    fn stored_chunks(&self) -> Result<Vec<ArrayIndices>, TensorError> {
        let state = self.state.read();
        let mut chunks: BTreeSet<ArrayIndices> = state.encoded.keys().cloned().collect();
        if let Some(tensor) = &state.tensor {
            chunks.extend(tensor.chunks.iter().cloned());
        }
        Ok(chunks.into_iter().collect())
    }

    fn retrieve_encoded_chunk(&self, chunk_indices: &[u64]) -> Result<Option<Bytes>, TensorError> {
        let state = self.state.read();
        if let Some(chunk) = state.encoded.get(chunk_indices) {
            return Ok(Some(encode_chunk(chunk)));
        }
        let Some(tensor) = &state.tensor else {
            return Ok(None);
        };
        if !tensor.chunks.contains(chunk_indices) {
            return Ok(None);
        }
        let shape = tensor.layout.shape();
        let mut chunk = ArrayD::from_elem(
            IxDyn(&shape_usize(tensor.layout.chunks())),
            f64::NAN,
        );
        if let Some(subset) = self.chunk_subset(chunk_indices, &shape) {
            let local = ArraySubset::new_with_shape(subset.shape().to_vec());
            subview_mut(&mut chunk, &local).assign(&subview(&tensor.values, &subset));
        }
        Ok(Some(encode_chunk(&chunk)))
    }

    fn store_encoded_chunk(&self, chunk_indices: &[u64], bytes: Bytes) -> Result<(), TensorError> {
        let ctx = self.ctx(TensorOperation::Chunk);
        let chunk = decode_chunk(&bytes, self.descriptor.chunks()).map_err(|reason| {
            ctx.invalid_metadata(format!("{}: {reason}", chunk_key_name(chunk_indices)))
        })?;
        let mut state = self.state.write();
        if let Some(tensor) = state.tensor.as_mut() {
            self.write_chunk_values(tensor, chunk_indices, &chunk);
        }
        state.encoded.insert(chunk_indices.to_vec(), chunk);
        Ok(())
    }

    fn erase_chunk(&self, chunk_indices: &[u64]) -> Result<(), TensorError> {
        let mut state = self.state.write();
        state.encoded.remove(chunk_indices);
        if let Some(tensor) = state.tensor.as_mut() {
            tensor.chunks.remove(chunk_indices);
            let shape = tensor.layout.shape();
            if let Some(subset) = self.chunk_subset(chunk_indices, &shape) {
                subview_mut(&mut tensor.values, &subset).fill(f64::NAN);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::tensor::{coordinates, Coordinate};

    fn tensor() -> MemoryTensorStorage {
        let descriptor = TensorDescriptor::new("prices", vec!["time".to_string()], vec![4]).unwrap();
        MemoryTensorStorage::new(descriptor).unwrap()
    }

    fn data(times: impl IntoIterator<Item = i64>, offset: f64) -> LabeledArray {
        let times = coordinates(times);
        let values = (0..times.len()).map(|i| offset + i as f64).collect();
        LabeledArray::from_shape_vec(&["time"], vec![times], values).unwrap()
    }

    #[test]
    fn memory_time_dimension() -> Result<(), Box<dyn Error>> {
        let tensor = tensor();
        tensor.store(data(0..10, 0.0), false)?;
        tensor.append(data([10], 10.0), "time")?;
        assert!(matches!(
            tensor.append(data([12], 12.0), "time"),
            Err(TensorError::IndexConflict { coordinate: Coordinate::Int(12), .. })
        ));
        tensor.update(data([3], 30.0))?;
        assert!(matches!(
            tensor.update(data([20], 0.0)),
            Err(TensorError::IndexConflict { coordinate: Coordinate::Int(20), .. })
        ));
        tensor.upsert(data([3, 20], 300.0))?;
        let read = tensor.read()?;
        assert_eq!(read.shape(), &[12]);
        assert_eq!(read.get(&[Coordinate::Int(3)]), Some(300.0));
        assert_eq!(read.get(&[Coordinate::Int(20)]), Some(301.0));
        assert_eq!(read.get(&[Coordinate::Int(10)]), Some(10.0));
        Ok(())
    }

    #[test]
    fn memory_chunks() -> Result<(), Box<dyn Error>> {
        let tensor = tensor();
        tensor.store(data(0..6, 0.0), false)?;
        assert_eq!(tensor.stored_chunks()?, vec![vec![0], vec![1]]);
        let bytes = tensor.retrieve_encoded_chunk(&[1])?.unwrap();
        let chunk = decode_chunk(&bytes, &[4])?;
        assert_eq!(chunk[[1]], 5.0);
        assert!(chunk[[2]].is_nan());

        tensor.erase_chunk(&[1])?;
        assert_eq!(tensor.stored_chunks()?, vec![vec![0]]);
        assert!(tensor.read()?.get(&[Coordinate::Int(5)]).unwrap().is_nan());
        tensor.store_encoded_chunk(&[1], bytes.clone())?;
        assert_eq!(tensor.read()?.get(&[Coordinate::Int(5)]), Some(5.0));
        assert_eq!(tensor.retrieve_encoded_chunk(&[1])?, Some(bytes));
        Ok(())
    }

    #[test]
    fn memory_layout_before_chunks() -> Result<(), Box<dyn Error>> {
        let source = tensor();
        source.store(data(0..6, 0.0), false)?;
        let target = tensor();
        for chunk in source.stored_chunks()? {
            let bytes = source.retrieve_encoded_chunk(&chunk)?.unwrap();
            target.store_encoded_chunk(&chunk, bytes)?;
        }
        assert!(!target.exists()?);
        target.write_layout(&source.layout()?.unwrap(), None)?;
        assert!(target.read()?.equals(&source.read()?));
        Ok(())
    }
}
