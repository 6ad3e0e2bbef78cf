//! Safetensors-backed parameter store.
//!
//! Shards are plain safetensors files. The container itself sorts tensors by
//! dtype and name when serializing, so the writer records the original
//! parameter order under [`ORDER_METADATA_KEY`] and the reader restores it.
//! Files written elsewhere fall back to on-disk data offset order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use safetensors::tensor::TensorView;
use safetensors::{SafeTensorError, SafeTensors};
use tracing::{debug, warn};

use crate::{MergeError, Parameter, ParameterMap, Result, Stage};

/// `__metadata__` key holding the JSON-encoded parameter order.
pub const ORDER_METADATA_KEY: &str = "pmetal.parameter_order";

/// Find all parameter files in a directory, sorted by file name.
///
/// A path to a single `.safetensors` file is accepted as well.
pub fn list_parameter_files(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let mut files = Vec::new();

    if path.is_file() && is_safetensors(path) {
        files.push(path.to_path_buf());
    } else if path.is_dir() {
        let read_dir = std::fs::read_dir(path).map_err(|e| MergeError::scratch(path, Stage::Split, e))?;
        for entry in read_dir {
            let file_path = entry.map_err(|e| MergeError::scratch(path, Stage::Split, e))?.path();
            if file_path.is_file() && is_safetensors(&file_path) {
                files.push(file_path);
            }
        }
    }

    if files.is_empty() {
        return Err(MergeError::DegenerateInput {
            path: path.to_path_buf(),
        });
    }

    files.sort();
    Ok(files)
}

pub(crate) fn is_safetensors(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "safetensors")
}

/// Read a whole shard into memory.
pub fn read_shard(path: impl AsRef<Path>) -> Result<ParameterMap> {
    let path = path.as_ref();
    let buffer = std::fs::read(path).map_err(|e| MergeError::scratch(path, Stage::Split, e))?;
    let mut params = ParameterMap::new();
    for_each_parameter(&buffer, |param| params.insert(param))?;
    debug!("Read {} parameters from {:?}", params.len(), path);
    Ok(params)
}

/// Write a shard, preserving the collection order.
pub fn write_shard(path: impl AsRef<Path>, params: &ParameterMap) -> Result<()> {
    let path = path.as_ref();

    let mut views = Vec::with_capacity(params.len());
    for p in params {
        views.push((p.name(), TensorView::new(p.dtype(), p.shape().to_vec(), p.data())?));
    }

    let order = serde_json::to_string(&params.names().collect::<Vec<_>>())?;
    let metadata = HashMap::from([
        ("format".to_string(), "pt".to_string()),
        (ORDER_METADATA_KEY.to_string(), order),
    ]);

    safetensors::serialize_to_file(views, &Some(metadata), path).map_err(|e| match e {
        SafeTensorError::IoError(io) => MergeError::scratch(path, Stage::Write, io),
        other => other.into(),
    })?;

    debug!("Wrote {} parameters to {:?}", params.len(), path);
    Ok(())
}

/// Decode every parameter of a serialized shard in stored order, handing each
/// one to `f` as an owned value.
///
/// Returns the number of parameters visited.
pub(crate) fn for_each_parameter(
    buffer: &[u8],
    mut f: impl FnMut(Parameter) -> Result<()>,
) -> Result<usize> {
    let tensors = SafeTensors::deserialize(buffer)?;
    let names = ordered_names(buffer, &tensors)?;

    for name in &names {
        let view = tensors.tensor(name)?;
        let param = Parameter::new(
            name.clone(),
            view.dtype(),
            view.shape().to_vec(),
            view.data().to_vec(),
        )?;
        f(param)?;
    }

    Ok(names.len())
}

fn ordered_names(buffer: &[u8], tensors: &SafeTensors<'_>) -> Result<Vec<String>> {
    let count = tensors.names().len();

    let (_, metadata) = SafeTensors::read_metadata(buffer)?;
    if let Some(order) = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(ORDER_METADATA_KEY))
    {
        match serde_json::from_str::<Vec<String>>(order) {
            Ok(names) if names.len() == count && names.iter().all(|n| tensors.tensor(n).is_ok()) => {
                return Ok(names);
            }
            Ok(names) => warn!(
                "Ignoring stale parameter order metadata ({} names for {} tensors)",
                names.len(),
                count
            ),
            Err(e) => warn!("Ignoring malformed parameter order metadata: {}", e),
        }
    }

    let base = buffer.as_ptr() as usize;
    let mut by_offset: Vec<(usize, String)> = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| (view.data().as_ptr() as usize - base, name))
        .collect();
    by_offset.sort();

    Ok(by_offset.into_iter().map(|(_, name)| name).collect())
}
