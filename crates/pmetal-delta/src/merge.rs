//! Delta application orchestration.
//!
//! This module provides the high-level API for applying a delta checkpoint to
//! a base checkpoint. Both inputs are re-sharded under the same byte budget,
//! then base shards are streamed one at a time while the delta side is served
//! by a single-shard [`ShardResolver`]. At most one base shard, one delta shard
//! and the merged shard being built are resident at any point.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::split::check_scratch_disjoint;
use crate::{
    apply_delta, CheckpointAssembler, DeltaConfig, MergeError, ModelSource, ParameterMap,
    ResolverStats, Result, ShardResolver, ShardSet, ShardSplitter, Stage, TokenizerInfo,
};

/// Progress of a running merge, reported after each parameter.
#[derive(Debug, Clone, Copy)]
pub struct MergeProgress<'a> {
    /// Name of the parameter just merged.
    pub name: &'a str,
    /// Index of the base shard being processed.
    pub shard: usize,
    /// Number of base shards.
    pub shards: usize,
    /// Parameters merged so far.
    pub merged: usize,
    /// Total parameters in the base collection.
    pub total: usize,
}

/// Callback invoked with merge progress.
pub type ProgressFn = Box<dyn FnMut(&MergeProgress<'_>)>;

/// Summary of a completed merge.
#[derive(Debug, Clone)]
pub struct MergeReport {
    /// Output checkpoint directory.
    pub output: PathBuf,
    /// Parameters merged.
    pub parameters: usize,
    /// Base shards after re-sharding.
    pub base_shards: usize,
    /// Delta shards after re-sharding.
    pub delta_shards: usize,
    /// Parameters whose leading dimension grew.
    pub grown: Vec<String>,
    /// Delta resolver counters.
    pub resolver: ResolverStats,
}

/// Main entry point for applying a delta.
///
/// # Arguments
/// * `config` - Delta configuration specifying base, delta and output
///
/// # Returns
/// A report describing the merged checkpoint
pub fn run_delta(config: &DeltaConfig) -> Result<MergeReport> {
    DeltaMerger::new(config.clone()).run()
}

/// Merge two in-memory collections without sharding.
///
/// Produces the same values as the streaming path and is meant for small
/// checkpoints and for checking streamed results.
pub fn merge_collections(
    base: ParameterMap,
    delta: &ParameterMap,
    tokenizer: Option<&TokenizerInfo>,
) -> Result<ParameterMap> {
    let mut merged = ParameterMap::new();
    for param in base {
        let delta_param = delta.get(param.name()).ok_or_else(|| MergeError::ShardNotFound {
            name: param.name().to_string(),
            shards: 1,
        })?;
        merged.insert(apply_delta(param, delta_param, tokenizer)?)?;
    }
    Ok(merged)
}

/// Streaming delta merger.
pub struct DeltaMerger {
    config: DeltaConfig,
    progress: Option<ProgressFn>,
}

impl DeltaMerger {
    /// Create a merger for `config`.
    pub fn new(config: DeltaConfig) -> Self {
        Self {
            config,
            progress: None,
        }
    }

    /// Report progress through `f` after every parameter.
    pub fn with_progress(mut self, f: impl FnMut(&MergeProgress<'_>) + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Run the merge to completion.
    ///
    /// Any error aborts the whole run and removes the staged output.
    pub fn run(mut self) -> Result<MergeReport> {
        self.config.validate()?;
        info!(
            "Applying delta {} to base {} (shard budget {} bytes)",
            self.config.delta_model, self.config.base_model, self.config.shard_size
        );

        let base_dir = ModelSource::parse(&self.config.base_model).resolve()?;
        let delta_dir = ModelSource::parse(&self.config.delta_model).resolve()?;
        check_scratch_disjoint(&self.config.scratch_dir, &[base_dir.as_path(), delta_dir.as_path()])?;

        let mut assembler = CheckpointAssembler::begin(&self.config.output_path, self.config.overwrite)?;

        let (report, sets) = match self.split_and_merge(&base_dir, &delta_dir, &mut assembler) {
            Ok(done) => done,
            Err(e) => {
                warn!("Merge aborted during {}: {}", e.stage(), e);
                assembler.abort();
                return Err(e);
            }
        };

        let output = assembler.finish(&base_dir)?;

        // The checkpoint is published; cleanup problems no longer fail the run.
        if !self.config.keep_scratch {
            clean_scratch(sets, &self.config.scratch_dir);
        }

        info!(
            "Delta applied: {} parameters, output saved to {:?}",
            report.parameters, output
        );
        Ok(MergeReport { output, ..report })
    }

    fn split_and_merge(
        &mut self,
        base_dir: &Path,
        delta_dir: &Path,
        assembler: &mut CheckpointAssembler,
    ) -> Result<(MergeReport, [ShardSet; 2])> {
        let splitter = ShardSplitter::new(self.config.shard_size);
        let base_set = splitter.split(base_dir, self.config.base_scratch())?;
        let delta_set = splitter.split(delta_dir, self.config.delta_scratch())?;

        let report = self.merge_shards(&base_set, &delta_set, assembler)?;
        Ok((report, [base_set, delta_set]))
    }

    fn merge_shards(
        &mut self,
        base_set: &ShardSet,
        delta_set: &ShardSet,
        assembler: &mut CheckpointAssembler,
    ) -> Result<MergeReport> {
        let tokenizer = self.config.tokenizer;
        let total = base_set.num_parameters();
        info!(
            "Merging {} parameters ({} base shards, {} delta shards)",
            total,
            base_set.len(),
            delta_set.len()
        );

        let mut resolver = ShardResolver::new(delta_set);
        resolver.prime()?;

        let mut merged_count = 0;
        let mut grown = Vec::new();

        for shard in base_set.shards() {
            debug!("Loading base shard {} from {:?}", shard.index(), shard.path());
            let base_params = shard.load().map_err(|e| e.at_stage(Stage::Split))?;
            let mut merged = ParameterMap::new();

            for param in base_params {
                let base_shape = param.shape().to_vec();
                let delta = resolver.resolve(param.name())?;
                let out = apply_delta(param, delta, tokenizer.as_ref())?;

                if out.shape() != base_shape.as_slice() {
                    grown.push(out.name().to_string());
                }
                merged_count += 1;
                if let Some(progress) = self.progress.as_mut() {
                    progress(&MergeProgress {
                        name: out.name(),
                        shard: shard.index(),
                        shards: base_set.len(),
                        merged: merged_count,
                        total,
                    });
                }
                merged.insert(out)?;
            }

            assembler.write_shard(shard.index(), base_set.len(), &merged)?;
        }

        let stats = resolver.stats();
        info!(
            "Resolver: {} lookups, {} resident hits, {} shard loads",
            stats.lookups, stats.hits, stats.shard_loads
        );

        Ok(MergeReport {
            output: assembler.output_dir().to_path_buf(),
            parameters: merged_count,
            base_shards: base_set.len(),
            delta_shards: delta_set.len(),
            grown,
            resolver: stats,
        })
    }
}

/// Remove scratch shard sets, logging instead of failing.
fn clean_scratch(sets: [ShardSet; 2], scratch_dir: &Path) {
    for set in sets {
        let dir = set.dir().to_path_buf();
        if let Err(e) = set.remove() {
            warn!("Failed to remove scratch shards in {:?}: {}", dir, e);
        }
    }
    // Only removed when nothing else lives there.
    if std::fs::remove_dir(scratch_dir).is_err() {
        debug!("Leaving scratch directory {:?} in place", scratch_dir);
    }
}

/// Builder for creating delta configurations programmatically.
#[derive(Debug, Default)]
pub struct DeltaBuilder {
    base_model: Option<String>,
    delta_model: Option<String>,
    output_path: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    shard_size: Option<u64>,
    tokenizer: Option<TokenizerInfo>,
    keep_scratch: bool,
    overwrite: bool,
}

impl DeltaBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base model.
    pub fn base_model(mut self, path: impl Into<String>) -> Self {
        self.base_model = Some(path.into());
        self
    }

    /// Set the delta model.
    pub fn delta_model(mut self, path: impl Into<String>) -> Self {
        self.delta_model = Some(path.into());
        self
    }

    /// Set the output path.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    /// Set the scratch directory.
    pub fn scratch_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(path.into());
        self
    }

    /// Set the per-shard byte budget.
    pub fn shard_size(mut self, bytes: u64) -> Self {
        self.shard_size = Some(bytes);
        self
    }

    /// Set tokenizer vocabulary information.
    pub fn tokenizer(mut self, vocab_size: usize, num_new_tokens: usize) -> Self {
        self.tokenizer = Some(TokenizerInfo {
            vocab_size,
            num_new_tokens,
        });
        self
    }

    /// Keep scratch shards after the run.
    pub fn keep_scratch(mut self, keep: bool) -> Self {
        self.keep_scratch = keep;
        self
    }

    /// Replace an existing output directory.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Build the delta configuration.
    pub fn build(self) -> Result<DeltaConfig> {
        let base_model = self
            .base_model
            .ok_or_else(|| MergeError::InvalidConfig("Base model is required".to_string()))?;
        let delta_model = self
            .delta_model
            .ok_or_else(|| MergeError::InvalidConfig("Delta model is required".to_string()))?;
        let output_path = self
            .output_path
            .ok_or_else(|| MergeError::InvalidConfig("Output path is required".to_string()))?;

        let mut config = DeltaConfig::new(base_model, delta_model, output_path);
        if let Some(scratch) = self.scratch_dir {
            config.scratch_dir = scratch;
        }
        if let Some(size) = self.shard_size {
            config.shard_size = size;
        }
        config.tokenizer = self.tokenizer;
        config.keep_scratch = self.keep_scratch;
        config.overwrite = self.overwrite;

        config.validate()?;
        Ok(config)
    }

    /// Build and run the merge.
    pub fn run(self) -> Result<MergeReport> {
        let config = self.build()?;
        run_delta(&config)
    }
}
