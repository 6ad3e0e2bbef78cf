//! PMetal CLI - delta checkpoint application.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pmetal_delta::{
    parse_byte_size, DeltaConfig, DeltaMerger, MergeError, ModelSource, ShardSplitter,
    TokenizerInfo, DEFAULT_SHARD_SIZE,
};

#[derive(Parser)]
#[command(name = "pmetal")]
#[command(author, version, about = "Memory-bounded delta application for sharded checkpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct a full checkpoint by adding a delta to its base model
    ApplyDelta {
        /// Path to delta configuration file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Base model (HuggingFace ID or local path)
        #[arg(long)]
        base: Option<String>,

        /// Delta model (HuggingFace ID or local path)
        #[arg(long)]
        delta: Option<String>,

        /// Output directory for the merged checkpoint
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Scratch directory for re-sharded inputs
        #[arg(long)]
        scratch_dir: Option<PathBuf>,

        /// Per-shard byte budget (e.g. 4GiB, 500MB, 1073741824)
        #[arg(long, value_parser = parse_shard_size)]
        shard_size: Option<u64>,

        /// Tokenizer vocabulary size including added tokens
        #[arg(long)]
        vocab_size: Option<usize>,

        /// Number of special tokens added on top of the base vocabulary
        #[arg(long, default_value = "0", requires = "vocab_size")]
        num_new_tokens: usize,

        /// Keep scratch shards after a successful run
        #[arg(long)]
        keep_scratch: bool,

        /// Replace an existing output directory
        #[arg(long)]
        overwrite: bool,
    },

    /// Re-shard a checkpoint under a byte budget and print the plan
    Split {
        /// Checkpoint directory or single safetensors file
        #[arg(short, long)]
        source: String,

        /// Directory to write the shards to (cleared first)
        #[arg(short, long)]
        output: PathBuf,

        /// Per-shard byte budget (e.g. 4GiB, 500MB, 1073741824)
        #[arg(long, value_parser = parse_shard_size, default_value_t = DEFAULT_SHARD_SIZE)]
        shard_size: u64,
    },
}

fn parse_shard_size(s: &str) -> Result<u64, String> {
    parse_byte_size(s).map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ApplyDelta {
            config,
            base,
            delta,
            output,
            scratch_dir,
            shard_size,
            vocab_size,
            num_new_tokens,
            keep_scratch,
            overwrite,
        } => {
            let mut config = match config {
                Some(path) => DeltaConfig::from_yaml_file(&path)
                    .with_context(|| format!("Failed to load config {:?}", path))?,
                None => {
                    let base = base.clone().context("--base is required without --config")?;
                    let delta = delta.clone().context("--delta is required without --config")?;
                    let output = output.clone().context("--output is required without --config")?;
                    DeltaConfig::new(base, delta, output)
                }
            };

            // Command line flags take precedence over the config file.
            if let Some(base) = base {
                config.base_model = base;
            }
            if let Some(delta) = delta {
                config.delta_model = delta;
            }
            if let Some(output) = output {
                config.output_path = output;
            }
            if let Some(scratch) = scratch_dir {
                config.scratch_dir = scratch;
            }
            if let Some(size) = shard_size {
                config.shard_size = size;
            }
            if let Some(vocab_size) = vocab_size {
                config.tokenizer = Some(TokenizerInfo {
                    vocab_size,
                    num_new_tokens,
                });
            }
            config.keep_scratch |= keep_scratch;
            config.overwrite |= overwrite;

            run_apply_delta(config)?;
        }

        Commands::Split {
            source,
            output,
            shard_size,
        } => {
            run_split(&source, output, shard_size)?;
        }
    }

    Ok(())
}

fn run_apply_delta(config: DeltaConfig) -> anyhow::Result<()> {
    println!("========================================");
    println!("  PMetal Delta Application");
    println!("========================================");
    println!("Base:       {}", config.base_model);
    println!("Delta:      {}", config.delta_model);
    println!("Output:     {}", config.output_path.display());
    println!("Scratch:    {}", config.scratch_dir.display());
    println!("Shard size: {} bytes", config.shard_size);
    if let Some(tok) = &config.tokenizer {
        println!(
            "Tokenizer:  {} tokens ({} added)",
            tok.vocab_size, tok.num_new_tokens
        );
    }
    println!("========================================\n");

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) | {msg}")?
            .progress_chars("#>-"),
    );

    let bar = progress.clone();
    let result = DeltaMerger::new(config)
        .with_progress(move |p| {
            bar.set_length(p.total as u64);
            bar.set_position(p.merged as u64);
            bar.set_message(format!("shard {}/{} {}", p.shard + 1, p.shards, p.name));
        })
        .run();

    let report = match result {
        Ok(report) => {
            progress.finish_with_message("done");
            report
        }
        Err(e) => {
            progress.abandon();
            return Err(describe_failure(e));
        }
    };

    println!("\n========================================");
    println!("  Delta Applied!");
    println!("========================================");
    println!("Parameters:   {}", report.parameters);
    println!("Base shards:  {}", report.base_shards);
    println!("Delta shards: {}", report.delta_shards);
    if !report.grown.is_empty() {
        println!("Grown:        {}", report.grown.join(", "));
    }
    println!(
        "Delta loads:  {} ({} of {} lookups hit the resident shard)",
        report.resolver.shard_loads, report.resolver.hits, report.resolver.lookups
    );
    println!("Output:       {}", report.output.display());
    println!("========================================");

    Ok(())
}

/// Attach the failing stage and parameter to the error report.
fn describe_failure(e: MergeError) -> anyhow::Error {
    let stage = e.stage();
    let context = match e.parameter() {
        Some(name) => format!("Delta application failed during {stage} at parameter '{name}'"),
        None => format!("Delta application failed during {stage}"),
    };
    anyhow::Error::new(e).context(context)
}

fn run_split(source: &str, output: PathBuf, shard_size: u64) -> anyhow::Result<()> {
    let source = ModelSource::parse(source)
        .resolve()
        .map_err(describe_failure)?;
    let set = ShardSplitter::new(shard_size)
        .split(&source, &output)
        .map_err(describe_failure)?;

    println!("========================================");
    println!("  Shard Plan ({} bytes per shard)", set.budget());
    println!("========================================");
    for shard in set.shards() {
        println!(
            "{:>4}  {:>12} bytes  {:>5} params  {}",
            shard.index(),
            shard.bytes(),
            shard.names().len(),
            shard.path().display()
        );
    }
    println!("========================================");
    println!("Shards:        {}", set.len());
    println!("Parameters:    {}", set.num_parameters());
    println!("Largest shard: {} bytes", set.max_shard_bytes());
    println!("========================================");

    Ok(())
}
