//! Training loop engine
//!
//! This module provides a hook-orchestrated training loop with checkpoint
//! based exact resumption.
//!
//! # Main Components
//!
//! - **Trainer**: loop driver owning models, optimizers and data sources
//! - **Context**: loop state shared between the trainer and its hooks
//! - **Hooks**: logging, metrics, checkpointing and learning rate scheduling
//! - **Checkpoints**: atomic on-disk checkpoint store
//! - **Data**: deterministic, skippable data loaders
//! - **Optimizers**: SGD with momentum and learning rate schedulers
//! - **Relay**: background executor for single-owner side effects
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hurricore::training::*;
//!
//! let mut trainer = Trainer::new(
//!     vec![Box::new(model)],
//!     vec![optimizer],
//!     vec![Box::new(loader)],
//!     loss_fn,
//!     Arc::new(SingleProcess),
//!     config.trainer.clone(),
//! )?
//! .with_hook(LoggerHook::new(config.logger.clone())?)
//! .with_hook(CheckpointHook::new(config.checkpoint.clone())?);
//!
//! // resumes from the newest checkpoint in `config.checkpoint.folder_path`
//! trainer.run()?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod context;
pub mod data;
pub mod hooks;
pub mod model;
pub mod optimizers;
pub mod parallel;
pub mod relay;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{
    CheckpointConfig, ConfigRegistry, DataLoaderConfig, LoggerConfig, LrSchedulerConfig, MetricConfig,
    OptimizerConfig, RunConfig, SchedulerConfig, SchedulerMode, SchedulerType, TrainerConfig,
};

// Loop re-exports
pub use context::Context;
pub use trainer::{LossFn, Trainer, TrainerStatus};

// Hook re-exports
pub use hooks::{CheckpointHook, Hook, HookEvent, LoggerHook, LrSchedulerHook, MetricHook};

// Checkpoint re-exports
pub use checkpoints::{CheckpointInfo, CheckpointManifest, CheckpointStore};

// Collaborator re-exports
pub use data::{DataLoader, DataSource, Dataset, InMemoryDataset, RangeDataset};
pub use model::{Model, VarMapModel};
pub use optimizers::schedulers::{Scheduler, SchedulerStateDict};
pub use optimizers::{create_optimizer, create_scheduler, Optimizer, OptimizerStateDict, SgdOptimizer};
pub use parallel::{Accelerator, LocalProcessGroup, SingleProcess};

// Relay re-exports
pub use relay::{log_relay, LogLevel, LogRecord, MessageRelay, RelayTarget};
