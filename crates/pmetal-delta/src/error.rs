//! Error types for delta application.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Stage of the delta workflow an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Source discovery and configuration.
    Setup,
    /// Re-sharding a source collection and reading scratch shards back.
    Split,
    /// Locating a delta parameter across the delta shard set.
    Resolve,
    /// Shape/dtype reconciliation and accumulation.
    Reconcile,
    /// Writing merged shards.
    Write,
    /// Finalizing the output checkpoint directory.
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::Split => "split",
            Self::Resolve => "resolve",
            Self::Reconcile => "reconcile",
            Self::Write => "write",
            Self::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while applying a delta.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Scratch directory or shard file could not be created, read or written.
    #[error("Scratch I/O error at {path:?} during {stage}: {source}")]
    ScratchIo {
        /// Path being accessed.
        path: PathBuf,
        /// Stage the access happened in.
        stage: Stage,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A base parameter has no counterpart in any delta shard.
    #[error("Parameter '{name}' not found in any of {shards} delta shards")]
    ShardNotFound {
        /// Parameter name.
        name: String,
        /// Number of shards scanned.
        shards: usize,
    },

    /// Shapes differ outside the vocabulary-growth exception.
    #[error("Shape mismatch for parameter '{name}': base {base:?}, delta {delta:?}")]
    ShapeMismatch {
        /// Parameter name.
        name: String,
        /// Base shape.
        base: Vec<usize>,
        /// Delta shape.
        delta: Vec<usize>,
    },

    /// A source yields zero parameters.
    #[error("Degenerate input: {path:?} contains no parameters")]
    DegenerateInput {
        /// Offending source file or directory.
        path: PathBuf,
    },

    /// Base and delta parameters have different dtypes.
    #[error("Dtype mismatch for parameter '{name}': base {base:?}, delta {delta:?}")]
    DtypeMismatch {
        /// Parameter name.
        name: String,
        /// Base dtype.
        base: safetensors::Dtype,
        /// Delta dtype.
        delta: safetensors::Dtype,
    },

    /// Arithmetic is not defined for this dtype.
    #[error("Unsupported dtype {dtype:?} for parameter '{name}'")]
    UnsupportedDtype {
        /// Parameter name.
        name: String,
        /// The dtype.
        dtype: safetensors::Dtype,
    },

    /// Output directory already exists and overwrite was not requested.
    #[error("Output path {0:?} already exists (set overwrite to replace it)")]
    OutputExists(PathBuf),

    /// Model source could not be resolved.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed or unserializable safetensors data.
    #[error("Safetensors error during {stage}: {source}")]
    Safetensors {
        /// Stage the shard was read or written in.
        stage: Stage,
        /// Underlying safetensors error.
        #[source]
        source: safetensors::SafeTensorError,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HuggingFace Hub error.
    #[error("Hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),
}

impl MergeError {
    /// Wrap an I/O error on a scratch path.
    pub(crate) fn scratch(path: impl Into<PathBuf>, stage: Stage, source: std::io::Error) -> Self {
        Self::ScratchIo {
            path: path.into(),
            stage,
            source,
        }
    }

    /// Re-tag a scratch I/O error with the stage that observed it.
    pub(crate) fn at_stage(self, stage: Stage) -> Self {
        match self {
            Self::ScratchIo { path, source, .. } => Self::ScratchIo {
                path,
                stage,
                source,
            },
            Self::Safetensors { source, .. } => Self::Safetensors { stage, source },
            other => other,
        }
    }

    /// The workflow stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::ScratchIo { stage, .. } | Self::Safetensors { stage, .. } => *stage,
            Self::ShardNotFound { .. } => Stage::Resolve,
            Self::ShapeMismatch { .. }
            | Self::DtypeMismatch { .. }
            | Self::UnsupportedDtype { .. } => Stage::Reconcile,
            Self::DegenerateInput { .. } => Stage::Split,
            Self::OutputExists(_)
            | Self::ModelLoad(_)
            | Self::InvalidConfig(_)
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::Hub(_) => Stage::Setup,
            Self::Serde(_) => Stage::Assemble,
        }
    }

    /// Name of the parameter involved, if any.
    pub fn parameter(&self) -> Option<&str> {
        match self {
            Self::ShardNotFound { name, .. }
            | Self::ShapeMismatch { name, .. }
            | Self::DtypeMismatch { name, .. }
            | Self::UnsupportedDtype { name, .. } => Some(name),
            _ => None,
        }
    }
}

// Shard decoding happens while splitting unless the caller re-tags it.
impl From<safetensors::SafeTensorError> for MergeError {
    fn from(source: safetensors::SafeTensorError) -> Self {
        Self::Safetensors {
            stage: Stage::Split,
            source,
        }
    }
}

/// Result type for delta operations.
pub type Result<T> = std::result::Result<T, MergeError>;
