use std::collections::HashMap;

use crate::{
    backend::{Selection, TensorStorage},
    backup::BackupReport,
    tensor::{Attributes, LabeledArray, TensorError},
};

use super::TensorStorageManager;

/// The arguments of an operation called by name.
///
/// Each operation reads the arguments it needs and ignores the rest.
#[derive(Clone, Debug, Default)]
pub struct OperationArgs {
    /// The data written by `store`, `append`, `update` and `upsert`.
    pub data: Option<LabeledArray>,
    /// The dimension extended by `append`, the caching dimension if omitted.
    pub dimension: Option<String>,
    /// The labels read by `read` and removed by `drop`.
    pub selection: Selection,
    /// The dimensions `update` reindexes to the stored labels, filling missing labels with `NaN`.
    pub complete_dims: Vec<String>,
    /// The attributes written by `set_attributes`.
    pub attributes: Attributes,
    /// Overwrite in `store`, `set_attributes` and `backup`, force in `update_from_backup`.
    pub overwrite: bool,
    /// Keep the backup copy in `delete_file`.
    pub only_local: bool,
}

impl OperationArgs {
    /// Create arguments carrying `data`.
    #[must_use]
    pub fn with_data(data: LabeledArray) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Set the dimension.
    #[must_use]
    pub fn dimension(mut self, dimension: impl Into<String>) -> Self {
        self.dimension = Some(dimension.into());
        self
    }

    /// Set the dimensions `update` reindexes to the stored labels.
    #[must_use]
    pub fn complete_dims<S: Into<String>>(mut self, dims: impl IntoIterator<Item = S>) -> Self {
        self.complete_dims = dims.into_iter().map(Into::into).collect();
        self
    }

    /// Set the overwrite flag.
    #[must_use]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    fn take_data(&mut self, name: &str) -> Result<LabeledArray, TensorError> {
        self.data
            .take()
            .ok_or_else(|| TensorError::Configuration(format!("operation {name} requires data")))
    }
}

/// The result of an operation called by name.
#[derive(Clone, Debug)]
pub enum OperationOutput {
    /// The operation returns nothing.
    None,
    /// Data read from the tensor.
    Data(LabeledArray),
    /// Whether the tensor exists.
    Exists(bool),
    /// The user attributes of the tensor.
    Attributes(Attributes),
    /// The outcome of a backup or recovery.
    Report(BackupReport),
}

/// An operation handler.
pub type OperationHandler =
    fn(&TensorStorageManager, &str, OperationArgs) -> Result<OperationOutput, TensorError>;

/// Operation handlers by name.
///
/// Created with a handler for every [`TensorStorage`] operation. Further handlers can be registered.
#[derive(Clone)]
pub struct OperationRegistry {
    handlers: HashMap<String, OperationHandler>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("OperationRegistry")
            .field("operations", &names)
            .finish()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    /// Create a registry of the built-in operations.
    #[must_use]
    pub fn new() -> Self {
        let builtin: [(&str, OperationHandler); 13] = [
            ("store", store),
            ("append", append),
            ("update", update),
            ("upsert", upsert),
            ("drop", drop_labels),
            ("read", read),
            ("exists", exists),
            ("get_attributes", get_attributes),
            ("set_attributes", set_attributes),
            ("backup", backup),
            ("update_from_backup", update_from_backup),
            ("delete_file", delete_file),
            ("close", close),
        ];
        Self {
            handlers: builtin
                .into_iter()
                .map(|(name, handler)| (name.to_string(), handler))
                .collect(),
        }
    }

    /// Register `handler` as `name`, replacing any handler of that name.
    pub fn register(&mut self, name: impl Into<String>, handler: OperationHandler) {
        self.handlers.insert(name.into(), handler);
    }

    /// Returns true if an operation is registered as `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Call the operation `name` on the tensor `tensor_id`.
    ///
    /// # Errors
    /// Returns [`TensorError::Configuration`] if no operation is registered as `name` or a required argument
    /// is missing, otherwise the error of the operation.
    pub fn call(
        &self,
        manager: &TensorStorageManager,
        tensor_id: &str,
        name: &str,
        args: OperationArgs,
    ) -> Result<OperationOutput, TensorError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| TensorError::Configuration(format!("unknown operation {name}")))?;
        tracing::debug!(tensor_id, operation = name, "calling operation");
        handler(manager, tensor_id, args)
    }
}

fn store(
    manager: &TensorStorageManager,
    tensor_id: &str,
    mut args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    let data = args.take_data("store")?;
    manager.handle(tensor_id)?.store(data, args.overwrite)?;
    Ok(OperationOutput::None)
}

fn append(
    manager: &TensorStorageManager,
    tensor_id: &str,
    mut args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    let data = args.take_data("append")?;
    let dimension = match args.dimension {
        Some(dimension) => dimension,
        None => manager
            .definition(tensor_id)?
            .cache
            .map(|cache| cache.dimension)
            .ok_or_else(|| {
                TensorError::Configuration("operation append requires a dimension".to_string())
            })?,
    };
    manager.handle(tensor_id)?.append(data, &dimension)?;
    Ok(OperationOutput::None)
}

fn update(
    manager: &TensorStorageManager,
    tensor_id: &str,
    mut args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    let data = args.take_data("update")?;
    let complete_dims: Vec<&str> = args.complete_dims.iter().map(String::as_str).collect();
    manager
        .handle(tensor_id)?
        .update_complete(data, &complete_dims)?;
    Ok(OperationOutput::None)
}

fn upsert(
    manager: &TensorStorageManager,
    tensor_id: &str,
    mut args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    let data = args.take_data("upsert")?;
    manager.handle(tensor_id)?.upsert(data)?;
    Ok(OperationOutput::None)
}

fn drop_labels(
    manager: &TensorStorageManager,
    tensor_id: &str,
    args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    manager.handle(tensor_id)?.drop_labels(&args.selection)?;
    Ok(OperationOutput::None)
}

fn read(
    manager: &TensorStorageManager,
    tensor_id: &str,
    args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    let data = manager.handle(tensor_id)?.read_selection(&args.selection)?;
    Ok(OperationOutput::Data(data))
}

fn exists(
    manager: &TensorStorageManager,
    tensor_id: &str,
    _args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    Ok(OperationOutput::Exists(manager.handle(tensor_id)?.exists()?))
}

fn get_attributes(
    manager: &TensorStorageManager,
    tensor_id: &str,
    _args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    Ok(OperationOutput::Attributes(
        manager.handle(tensor_id)?.attributes()?,
    ))
}

fn set_attributes(
    manager: &TensorStorageManager,
    tensor_id: &str,
    args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    manager
        .handle(tensor_id)?
        .set_attributes(args.attributes, args.overwrite)?;
    Ok(OperationOutput::None)
}

fn backup(
    manager: &TensorStorageManager,
    tensor_id: &str,
    args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    Ok(OperationOutput::Report(
        manager.backup(tensor_id, args.overwrite)?,
    ))
}

fn update_from_backup(
    manager: &TensorStorageManager,
    tensor_id: &str,
    args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    Ok(OperationOutput::Report(
        manager.update_from_backup(tensor_id, args.overwrite)?,
    ))
}

fn delete_file(
    manager: &TensorStorageManager,
    tensor_id: &str,
    args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    manager.handle(tensor_id)?.delete_file(args.only_local)?;
    Ok(OperationOutput::None)
}

fn close(
    manager: &TensorStorageManager,
    tensor_id: &str,
    _args: OperationArgs,
) -> Result<OperationOutput, TensorError> {
    manager.close(tensor_id)?;
    Ok(OperationOutput::None)
}
