//! Configuration types for delta application.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{MergeError, Result};

/// Default per-shard byte budget (4 GiB).
pub const DEFAULT_SHARD_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Complete delta configuration, typically loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Base model (local path or HuggingFace repo ID).
    pub base_model: String,

    /// Delta model (local path or HuggingFace repo ID).
    pub delta_model: String,

    /// Output directory for the merged checkpoint.
    pub output_path: PathBuf,

    /// Scratch directory for re-sharded inputs.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Per-shard byte budget. Accepts integers or strings like `"4GiB"`.
    #[serde(default = "default_shard_size", deserialize_with = "deserialize_byte_size")]
    pub shard_size: u64,

    /// Vocabulary information from the tokenizer, if known.
    #[serde(default)]
    pub tokenizer: Option<TokenizerInfo>,

    /// Keep scratch shards after a successful run.
    #[serde(default)]
    pub keep_scratch: bool,

    /// Replace an existing output directory.
    #[serde(default)]
    pub overwrite: bool,
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from(".pmetal-delta-scratch")
}

fn default_shard_size() -> u64 {
    DEFAULT_SHARD_SIZE
}

/// Vocabulary sizes reported by the tokenizer collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerInfo {
    /// Vocabulary size after special tokens were added.
    pub vocab_size: usize,

    /// Number of special tokens added on top of the base vocabulary.
    #[serde(default)]
    pub num_new_tokens: usize,
}

impl DeltaConfig {
    /// Create a configuration with defaults for everything but the paths.
    pub fn new(
        base_model: impl Into<String>,
        delta_model: impl Into<String>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_model: base_model.into(),
            delta_model: delta_model.into(),
            output_path: output_path.into(),
            scratch_dir: default_scratch_dir(),
            shard_size: DEFAULT_SHARD_SIZE,
            tokenizer: None,
            keep_scratch: false,
            overwrite: false,
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Scratch directory for the re-sharded base.
    pub fn base_scratch(&self) -> PathBuf {
        self.scratch_dir.join("base")
    }

    /// Scratch directory for the re-sharded delta.
    pub fn delta_scratch(&self) -> PathBuf {
        self.scratch_dir.join("delta")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.base_model.is_empty() {
            return Err(MergeError::InvalidConfig("base_model is required".to_string()));
        }
        if self.delta_model.is_empty() {
            return Err(MergeError::InvalidConfig("delta_model is required".to_string()));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(MergeError::InvalidConfig("output_path is required".to_string()));
        }
        if self.shard_size == 0 {
            return Err(MergeError::InvalidConfig("shard_size must be positive".to_string()));
        }
        if self.scratch_dir == self.output_path {
            return Err(MergeError::InvalidConfig(
                "scratch_dir and output_path must differ".to_string(),
            ));
        }
        if let Some(tok) = &self.tokenizer {
            if tok.num_new_tokens > tok.vocab_size {
                return Err(MergeError::InvalidConfig(format!(
                    "num_new_tokens ({}) exceeds vocab_size ({})",
                    tok.num_new_tokens, tok.vocab_size
                )));
            }
        }
        Ok(())
    }
}

/// Parse a byte size such as `4294967296`, `"4GiB"`, `"500MB"` or `"1.5G"`.
///
/// Decimal suffixes (`K`, `KB`, `M`, `MB`, ...) are powers of 1000, binary
/// suffixes (`KiB`, `MiB`, ...) powers of 1024.
pub fn parse_byte_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let invalid = || MergeError::InvalidConfig(format!("Invalid byte size: {s:?}"));

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "ki" | "kib" => 1 << 10,
        "mi" | "mib" => 1 << 20,
        "gi" | "gib" => 1 << 30,
        "ti" | "tib" => 1 << 40,
        _ => return Err(invalid()),
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier).ok_or_else(invalid);
    }

    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes.round() as u64)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ByteSize {
    Bytes(u64),
    Text(String),
}

fn deserialize_byte_size<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    match ByteSize::deserialize(deserializer)? {
        ByteSize::Bytes(n) => Ok(n),
        ByteSize::Text(s) => parse_byte_size(&s).map_err(serde::de::Error::custom),
    }
}
