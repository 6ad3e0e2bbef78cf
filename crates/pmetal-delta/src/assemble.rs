//! Output checkpoint assembly.
//!
//! Merged shards are written into a `<output>.partial` staging directory. Only
//! once every shard is in place are the auxiliary base files copied, the index
//! regenerated from the shards actually written, and the staging directory
//! renamed to the output path. A failed run never leaves a directory at the
//! output path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::{is_safetensors, write_shard};
use crate::{MergeError, ParameterMap, Result, Stage};

/// File name of the safetensors weight index.
pub const INDEX_FILE: &str = "model.safetensors.index.json";

/// Extensions of weight files that are never copied from the base directory.
const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "bin", "pt", "pth", "gguf"];

/// Base files that describe the base layout and would be stale.
const STALE_FILES: &[&str] = &[INDEX_FILE, "pytorch_model.bin.index.json"];

/// Weight index for sharded checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightIndex {
    /// Metadata about the weights (`total_size`).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Mapping from parameter name to shard filename.
    pub weight_map: BTreeMap<String, String>,
}

impl WeightIndex {
    /// Total size recorded in the metadata.
    pub fn total_size(&self) -> Option<u64> {
        self.metadata.get("total_size").and_then(|v| v.as_u64())
    }
}

/// HF-style name of the shard at `index` out of `total`.
pub fn shard_file_name(index: usize, total: usize) -> String {
    if total <= 1 {
        "model.safetensors".to_string()
    } else {
        format!("model-{:05}-of-{:05}.safetensors", index + 1, total)
    }
}

/// Collects merged shards and finalizes the output directory.
#[derive(Debug)]
pub struct CheckpointAssembler {
    staging: PathBuf,
    output: PathBuf,
    overwrite: bool,
    weight_map: BTreeMap<String, String>,
    total_size: u64,
    shards_written: usize,
}

impl CheckpointAssembler {
    /// Prepare a fresh staging directory next to `output`.
    pub fn begin(output: impl AsRef<Path>, overwrite: bool) -> Result<Self> {
        let output = output.as_ref().to_path_buf();
        if output.exists() && !overwrite {
            return Err(MergeError::OutputExists(output));
        }

        let file_name = output
            .file_name()
            .ok_or_else(|| MergeError::InvalidConfig(format!("Invalid output path {:?}", output)))?;
        let mut staging_name = file_name.to_os_string();
        staging_name.push(".partial");
        let staging = output.with_file_name(staging_name);

        if staging.exists() {
            debug!("Removing stale staging directory {:?}", staging);
            std::fs::remove_dir_all(&staging).map_err(|e| MergeError::scratch(&staging, Stage::Write, e))?;
        }
        std::fs::create_dir_all(&staging).map_err(|e| MergeError::scratch(&staging, Stage::Write, e))?;

        Ok(Self {
            staging,
            output,
            overwrite,
            weight_map: BTreeMap::new(),
            total_size: 0,
            shards_written: 0,
        })
    }

    /// Directory merged shards are staged in.
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Final output directory.
    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    /// Write merged shard `index` of `total` into the staging directory.
    pub fn write_shard(&mut self, index: usize, total: usize, params: &ParameterMap) -> Result<PathBuf> {
        let file_name = shard_file_name(index, total);
        let path = self.staging.join(&file_name);
        write_shard(&path, params).map_err(|e| e.at_stage(Stage::Write))?;

        for name in params.names() {
            self.weight_map.insert(name.to_string(), file_name.clone());
        }
        self.total_size += params.byte_size() as u64;
        self.shards_written += 1;

        info!("Wrote merged shard {:?} ({} parameters)", path, params.len());
        Ok(path)
    }

    /// Copy auxiliary base files, write the index and publish the output.
    pub fn finish(self, base_dir: &Path) -> Result<PathBuf> {
        if base_dir.is_dir() {
            copy_auxiliary_files(base_dir, &self.staging)?;
        }

        if self.shards_written > 1 {
            let index = WeightIndex {
                metadata: BTreeMap::from([("total_size".to_string(), self.total_size.into())]),
                weight_map: self.weight_map,
            };
            let path = self.staging.join(INDEX_FILE);
            let json = serde_json::to_string_pretty(&index)?;
            std::fs::write(&path, json).map_err(|e| MergeError::scratch(&path, Stage::Assemble, e))?;
            debug!("Wrote {:?}", path);
        }

        if self.output.exists() && self.overwrite {
            std::fs::remove_dir_all(&self.output)
                .map_err(|e| MergeError::scratch(&self.output, Stage::Assemble, e))?;
        }
        std::fs::rename(&self.staging, &self.output)
            .map_err(|e| MergeError::scratch(&self.output, Stage::Assemble, e))?;

        info!("Checkpoint assembled at {:?}", self.output);
        Ok(self.output)
    }

    /// Discard the staging directory after a failure.
    pub fn abort(self) {
        if let Err(e) = std::fs::remove_dir_all(&self.staging) {
            warn!("Failed to remove staging directory {:?}: {}", self.staging, e);
        }
    }
}

fn copy_auxiliary_files(base_dir: &Path, dest: &Path) -> Result<()> {
    let read_dir = std::fs::read_dir(base_dir).map_err(|e| MergeError::scratch(base_dir, Stage::Assemble, e))?;
    for entry in read_dir {
        let src = entry.map_err(|e| MergeError::scratch(base_dir, Stage::Assemble, e))?.path();
        if !src.is_file() || is_weight_file(&src) {
            continue;
        }
        let Some(name) = src.file_name() else {
            continue;
        };
        if name.to_string_lossy().starts_with('.') || STALE_FILES.iter().any(|s| name == *s) {
            continue;
        }

        let dst = dest.join(name);
        std::fs::copy(&src, &dst).map_err(|e| MergeError::scratch(&dst, Stage::Assemble, e))?;
        debug!("Copied {:?} -> {:?}", src, dst);
    }
    Ok(())
}

fn is_weight_file(path: &Path) -> bool {
    is_safetensors(path)
        || path
            .extension()
            .is_some_and(|ext| WEIGHT_EXTENSIONS.iter().any(|w| ext == *w))
}
