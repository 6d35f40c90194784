use std::sync::Arc;

use tensordb::backend::{
    ChunkedTensorStorage, MemoryTensorStorage, Selection, TensorStorage, COORDINATES_ATTRIBUTE,
};
use tensordb::storage::store::{FilesystemStore, MemoryStore};
use tensordb::storage::{ReadableStorageTraits, ReadableWritableListableStorage, StoreKey};
use tensordb::tensor::{
    coordinates, Attributes, Coordinate, LabeledArray, TensorDescriptor, TensorError,
};

fn descriptor() -> TensorDescriptor {
    TensorDescriptor::new("market/prices", vec!["time".to_string()], vec![4]).unwrap()
}

fn series(times: impl IntoIterator<Item = i64>, offset: f64) -> LabeledArray {
    let times = coordinates(times);
    let values = (0..times.len()).map(|i| offset + i as f64).collect();
    LabeledArray::from_shape_vec(&["time"], vec![times], values).unwrap()
}

fn time_dimension(tensor: &dyn TensorStorage) -> Result<(), Box<dyn std::error::Error>> {
    assert!(!tensor.exists()?);
    tensor.store(series(0..10, 0.0), false)?;
    assert!(matches!(
        tensor.store(series(0..10, 0.0), false),
        Err(TensorError::AlreadyExists { .. })
    ));

    tensor.append(series([10], 10.0), "time")?;
    assert!(matches!(
        tensor.append(series([12], 12.0), "time"),
        Err(TensorError::IndexConflict { coordinate: Coordinate::Int(12), ref dimension, .. }) if dimension == "time"
    ));

    tensor.update(series([3], 30.0))?;
    assert!(matches!(
        tensor.update(series([20], 0.0)),
        Err(TensorError::IndexConflict { coordinate: Coordinate::Int(20), .. })
    ));

    tensor.upsert(series([3, 20], 300.0))?;
    let read = tensor.read()?;
    let mut expected_times: Vec<i64> = (0..=10).collect();
    expected_times.push(20);
    assert_eq!(read.labels("time"), Some(coordinates(expected_times).as_slice()));
    assert_eq!(read.get(&[Coordinate::Int(3)]), Some(300.0));
    assert_eq!(read.get(&[Coordinate::Int(10)]), Some(10.0));
    assert_eq!(read.get(&[Coordinate::Int(20)]), Some(301.0));
    assert!(read.get(&[Coordinate::Int(15)]).is_none());

    let selection = Selection::new().with("time", coordinates([20, 0]));
    let read = tensor.read_selection(&selection)?;
    assert_eq!(read.values().as_slice(), Some([301.0, 0.0].as_slice()));
    Ok(())
}

#[test]
fn time_dimension_memory_backend() -> Result<(), Box<dyn std::error::Error>> {
    time_dimension(&MemoryTensorStorage::new(descriptor())?)
}

#[test]
fn time_dimension_memory_store() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    time_dimension(&ChunkedTensorStorage::new(descriptor(), store)?)
}

#[test]
fn time_dimension_filesystem_store() -> Result<(), Box<dyn std::error::Error>> {
    let path = tempfile::TempDir::new()?;
    let store = Arc::new(FilesystemStore::new(path.path())?);
    time_dimension(&ChunkedTensorStorage::new(descriptor(), store)?)?;
    assert!(path.path().join("market/prices/zarr.json").exists());
    assert!(path.path().join("market/prices/c/0").exists());
    assert!(path.path().join("market/prices/c/2").exists());
    Ok(())
}

#[test]
fn reopen_filesystem_store() -> Result<(), Box<dyn std::error::Error>> {
    let path = tempfile::TempDir::new()?;
    let data = LabeledArray::from_shape_vec(
        &["time", "asset"],
        vec![coordinates(0..5), coordinates(["b", "a", "c"])],
        (0..15).map(f64::from).collect(),
    )?;
    let descriptor = TensorDescriptor::new(
        "prices",
        vec!["asset".to_string(), "time".to_string()],
        vec![2, 2],
    )?;
    {
        let store: ReadableWritableListableStorage = Arc::new(FilesystemStore::new(path.path())?);
        let tensor = ChunkedTensorStorage::new(descriptor.clone(), store)?;
        tensor.store(data.clone(), false)?;
        let mut attributes = Attributes::new();
        attributes.insert("units".to_string(), "USD".into());
        tensor.set_attributes(attributes, false)?;
    }

    let store: ReadableWritableListableStorage = Arc::new(FilesystemStore::new(path.path())?);
    let tensor = ChunkedTensorStorage::new(descriptor, store.clone())?;
    let read = tensor.read()?;
    assert_eq!(read.dims(), &["asset", "time"]);
    assert!(read.equals(&data.transposed(read.dims())?.sorted()));
    assert_eq!(tensor.attributes()?["units"], "USD");
    assert!(!tensor.attributes()?.contains_key(COORDINATES_ATTRIBUTE));

    let metadata = store
        .get(&StoreKey::new("prices/zarr.json")?)?
        .ok_or("missing metadata")?;
    let metadata: serde_json::Value = serde_json::from_slice(&metadata)?;
    assert_eq!(metadata["zarr_format"], 3);
    assert_eq!(metadata["shape"], serde_json::json!([3, 5]));
    assert_eq!(metadata["dimension_names"], serde_json::json!(["asset", "time"]));
    assert_eq!(metadata["fill_value"], "NaN");
    assert_eq!(
        metadata["attributes"][COORDINATES_ATTRIBUTE]["asset"],
        serde_json::json!(["a", "b", "c"])
    );
    Ok(())
}

#[test]
fn upsert_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let tensor = ChunkedTensorStorage::new(descriptor(), store)?;
    tensor.store(series([0, 2, 4, 6], 0.0), false)?;
    let upsert = series([1, 4, 9], 10.0);
    tensor.upsert(upsert.clone())?;
    let once = tensor.read()?;
    let chunks = tensor.stored_chunks()?;
    tensor.upsert(upsert)?;
    let twice = tensor.read()?;
    assert!(once.equals(&twice));
    assert_eq!(tensor.stored_chunks()?, chunks);
    assert_eq!(
        once.labels("time"),
        Some(coordinates([0, 1, 2, 4, 6, 9]).as_slice())
    );
    assert_eq!(once.get(&[Coordinate::Int(1)]), Some(10.0));
    assert_eq!(once.get(&[Coordinate::Int(2)]), Some(1.0));
    assert_eq!(once.get(&[Coordinate::Int(4)]), Some(11.0));
    assert_eq!(once.get(&[Coordinate::Int(6)]), Some(3.0));
    Ok(())
}

#[test]
fn delete_file() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let backup_store = Arc::new(MemoryStore::new());
    let tensor = ChunkedTensorStorage::new(descriptor(), store.clone())?
        .with_backup_store(backup_store.clone());
    tensor.store(series(0..6, 0.0), false)?;
    let backup = tensor.backup_copy()?.ok_or("no backup store")?;
    tensor.backup(&backup, false)?;
    assert!(backup.exists()?);

    tensor.delete_file(true)?;
    assert!(!tensor.exists()?);
    assert!(backup.exists()?);
    tensor.delete_file(false)?;
    assert!(!backup.exists()?);
    assert!(store.is_empty());
    assert!(backup_store.is_empty());
    Ok(())
}

fn drop_and_complete(tensor: &dyn TensorStorage) -> Result<(), Box<dyn std::error::Error>> {
    tensor.store(series(0..10, 0.0), false)?;
    let mut attributes = Attributes::new();
    attributes.insert("units".to_string(), "USD".into());
    tensor.set_attributes(attributes, false)?;

    tensor.drop_labels(&Selection::new().with("time", coordinates([3, 7])))?;
    let read = tensor.read()?;
    assert_eq!(
        read.labels("time"),
        Some(coordinates([0, 1, 2, 4, 5, 6, 8, 9]).as_slice())
    );
    assert_eq!(read.get(&[Coordinate::Int(4)]), Some(4.0));
    assert_eq!(read.get(&[Coordinate::Int(9)]), Some(9.0));
    assert_eq!(tensor.attributes()?["units"], "USD");

    assert!(matches!(
        tensor.drop_labels(&Selection::new().with("time", coordinates([3]))),
        Err(TensorError::IndexConflict { coordinate: Coordinate::Int(3), .. })
    ));
    assert!(matches!(
        tensor.drop_labels(&Selection::new().with("asset", coordinates(["a"]))),
        Err(TensorError::DimensionMismatch { .. })
    ));
    tensor.drop_labels(&Selection::new())?;
    assert!(tensor.read()?.equals(&read));

    // labels missing from the data are cleared, labels missing from the tensor are ignored
    tensor.update_complete(series([2, 5, 30], 20.0), &["time"])?;
    let read = tensor.read()?;
    assert_eq!(read.labels("time").map(<[Coordinate]>::len), Some(8));
    assert_eq!(read.get(&[Coordinate::Int(2)]), Some(20.0));
    assert_eq!(read.get(&[Coordinate::Int(5)]), Some(21.0));
    assert!(read.get(&[Coordinate::Int(0)]).is_some_and(f64::is_nan));
    assert!(read.get(&[Coordinate::Int(9)]).is_some_and(f64::is_nan));
    assert!(read.get(&[Coordinate::Int(30)]).is_none());

    tensor.update_complete(series([0], 50.0), &[])?;
    assert_eq!(tensor.read()?.get(&[Coordinate::Int(0)]), Some(50.0));
    assert!(matches!(
        tensor.update_complete(series([0], 50.0), &["asset"]),
        Err(TensorError::DimensionMismatch { .. })
    ));
    Ok(())
}

#[test]
fn drop_and_complete_memory_backend() -> Result<(), Box<dyn std::error::Error>> {
    drop_and_complete(&MemoryTensorStorage::new(descriptor())?)
}

#[test]
fn drop_and_complete_memory_store() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let tensor = ChunkedTensorStorage::new(descriptor(), store)?;
    drop_and_complete(&tensor)?;
    // ten labels in chunks of four shrank to eight
    assert_eq!(tensor.stored_chunks()?, vec![vec![0], vec![1]]);
    Ok(())
}
