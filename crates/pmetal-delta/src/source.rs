//! Model sources: local directories or HuggingFace Hub repositories.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::{MergeError, Result};

/// A model source that can be resolved to a local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Local path to model directory or file.
    Local(PathBuf),
    /// HuggingFace Hub repository ID.
    Hub {
        /// Repository ID (e.g., "lmsys/vicuna-7b-delta-v1.1").
        repo_id: String,
        /// Optional revision (branch, tag, or commit).
        revision: Option<String>,
    },
}

impl ModelSource {
    /// Create a model source from a local path.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::Local(path.as_ref().to_path_buf())
    }

    /// Create a model source from a HuggingFace repo ID.
    pub fn from_hub(repo_id: impl Into<String>) -> Self {
        Self::Hub {
            repo_id: repo_id.into(),
            revision: None,
        }
    }

    /// Parse a model source from a string.
    ///
    /// Existing paths and anything starting with `/` or `.` are local;
    /// `org/name` is a Hub repo; a trailing `@rev` selects a Hub revision.
    pub fn parse(s: &str) -> Self {
        let path = Path::new(s);
        if path.exists() || s.starts_with('/') || s.starts_with('.') {
            return Self::Local(path.to_path_buf());
        }

        #[cfg(windows)]
        if s.contains('\\') {
            return Self::Local(path.to_path_buf());
        }

        if s.matches('/').count() == 1 {
            if let Some((repo_id, revision)) = s.split_once('@') {
                return Self::Hub {
                    repo_id: repo_id.to_string(),
                    revision: Some(revision.to_string()),
                };
            }
            return Self::from_hub(s);
        }

        Self::Local(path.to_path_buf())
    }

    /// Resolve to a local directory (or single file), downloading if needed.
    pub fn resolve(&self) -> Result<PathBuf> {
        match self {
            Self::Local(path) => {
                if !path.exists() {
                    return Err(MergeError::ModelLoad(format!("{:?} does not exist", path)));
                }
                Ok(path.clone())
            }
            Self::Hub { repo_id, revision } => {
                info!("Downloading model from Hub: {}", repo_id);

                let api = hf_hub::api::sync::Api::new()?;
                let repo = match revision {
                    Some(rev) => api.repo(hf_hub::Repo::with_revision(
                        repo_id.clone(),
                        hf_hub::RepoType::Model,
                        rev.clone(),
                    )),
                    None => api.model(repo_id.clone()),
                };

                let files: Vec<String> = repo
                    .info()?
                    .siblings
                    .into_iter()
                    .map(|s| s.rfilename)
                    .filter(|f| is_checkpoint_file(f))
                    .collect();

                if !files.iter().any(|f| f.ends_with(".safetensors")) {
                    return Err(MergeError::ModelLoad(format!(
                        "No safetensors files found in repo {}",
                        repo_id
                    )));
                }

                let mut model_dir = None;
                for file in &files {
                    let local = repo.get(file)?;
                    // Files in subdirectories are not part of the checkpoint root.
                    if model_dir.is_none() && !file.contains('/') {
                        model_dir = local.parent().map(Path::to_path_buf);
                    }
                }

                model_dir.ok_or_else(|| {
                    MergeError::ModelLoad(format!("Could not locate snapshot directory for {}", repo_id))
                })
            }
        }
    }
}

/// Files fetched for a Hub checkpoint: weights plus the tokenizer and config
/// artifacts the output directory carries over.
fn is_checkpoint_file(name: &str) -> bool {
    if name.contains('/') {
        return false;
    }
    name.ends_with(".safetensors")
        || name.ends_with(".json")
        || name.ends_with(".model")
        || name.ends_with(".txt")
        || name.ends_with(".tiktoken")
}
