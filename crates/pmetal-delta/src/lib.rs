//! Memory-bounded delta application for PMetal
//!
//! This crate reconstructs a full checkpoint by adding a published delta
//! checkpoint to its base model, one shard at a time. Peak memory is bounded
//! by a configurable shard budget rather than by model size.
//!
//! # Pipeline
//!
//! 1. **Split**: re-shard base and delta into scratch files under the budget,
//!    preserving parameter order
//! 2. **Resolve**: look up each base parameter in the delta shards while only
//!    one delta shard is resident
//! 3. **Reconcile**: widen vocabulary-dependent matrices when the delta adds
//!    special tokens
//! 4. **Assemble**: write merged shards to a staging directory, regenerate the
//!    weight index and publish the result
//!
//! # Example
//!
//! ```ignore
//! use pmetal_delta::DeltaBuilder;
//!
//! let report = DeltaBuilder::new()
//!     .base_model("./llama-7b")
//!     .delta_model("lmsys/vicuna-7b-delta-v1.1")
//!     .output("./vicuna-7b")
//!     .shard_size(4 << 30)
//!     .run()?;
//!
//! println!("merged {} parameters", report.parameters);
//! ```

#![warn(missing_docs)]

mod assemble;
mod config;
mod error;
mod merge;
mod parameter;
mod reconcile;
mod resolver;
mod source;
mod split;
pub mod store;

pub use assemble::*;
pub use config::*;
pub use error::*;
pub use merge::*;
pub use parameter::*;
pub use reconcile::*;
pub use resolver::*;
pub use source::*;
pub use split::*;

/// Re-export of the safetensors element type.
pub use safetensors::Dtype;
