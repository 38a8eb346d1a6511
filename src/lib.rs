//! Hurricore - hook-orchestrated training loop engine
//!
//! This crate provides a generic training loop that delegates logging,
//! metric recording, checkpointing and learning rate scheduling to
//! pluggable hooks, and that resumes exactly, mid-epoch, from the newest
//! valid checkpoint after an interruption.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod error;
pub mod logging;
pub mod training;
pub mod utils;

// Re-exports
pub use error::{Error, Result};
pub use training::{
    CheckpointHook, Context, DataLoader, Hook, LoggerHook, LrSchedulerHook, MetricHook, RunConfig, Trainer,
};

/// Crate version, recorded in checkpoint manifests
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
