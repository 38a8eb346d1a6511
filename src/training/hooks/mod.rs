//! Lifecycle hooks
//!
//! Everything the loop driver does besides iterating data and running the
//! training step lives in hooks: logging, metric recording, checkpointing
//! and learning rate scheduling. Hooks fire in registration order, the same
//! order for every lifecycle event, and receive the trainer itself so they
//! can read and write the shared [`Context`](crate::training::Context).
//!
//! Ordering between hooks is the caller's responsibility. In particular the
//! [`LrSchedulerHook`] must be registered before the [`CheckpointHook`] so
//! that a checkpoint captures the schedule after the step it was written at.

use std::any::Any;

use anyhow::Result;

use crate::training::trainer::Trainer;

pub mod checkpoint;
pub mod logger;
pub mod lr_scheduler;
pub mod metrics;

pub use checkpoint::CheckpointHook;
pub use logger::LoggerHook;
pub use lr_scheduler::LrSchedulerHook;
pub use metrics::MetricHook;

/// Downcasting support for registered hooks
pub trait AsAny: Any {
    /// View as `Any`
    fn as_any(&self) -> &dyn Any;

    /// View as mutable `Any`
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Observer of the training loop.
///
/// Every lifecycle method defaults to a no-op, so a hook only implements the
/// events it cares about.
pub trait Hook: AsAny + Send {
    /// Hook name for logs and error reports
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Whether a failure of this hook aborts training.
    ///
    /// Failures of non-critical hooks are reported and the loop continues.
    fn is_critical(&self) -> bool {
        true
    }

    /// Called once before the first epoch
    fn on_training_start(&mut self, _trainer: &mut Trainer) -> Result<()> {
        Ok(())
    }

    /// Called at the start of each epoch, after `iterator_length` is known
    fn on_epoch_start(&mut self, _trainer: &mut Trainer) -> Result<()> {
        Ok(())
    }

    /// Called before each training step, with the step's batch in context
    fn on_step_start(&mut self, _trainer: &mut Trainer) -> Result<()> {
        Ok(())
    }

    /// Called after each training step, with `step_loss` recorded
    fn on_step_end(&mut self, _trainer: &mut Trainer) -> Result<()> {
        Ok(())
    }

    /// Called after the last step of each epoch
    fn on_epoch_end(&mut self, _trainer: &mut Trainer) -> Result<()> {
        Ok(())
    }

    /// Called once after the last epoch
    fn on_training_end(&mut self, _trainer: &mut Trainer) -> Result<()> {
        Ok(())
    }

    /// Called when loop state was restored from a checkpoint
    fn on_checkpoint_restored(&mut self, _trainer: &mut Trainer) -> Result<()> {
        Ok(())
    }

    /// Called before a fatal error is propagated out of the loop
    fn on_fatal_error(&mut self, _trainer: &mut Trainer, _error: &crate::Error) {}
}

/// Lifecycle points at which hooks are invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    TrainingStart,
    EpochStart,
    StepStart,
    StepEnd,
    EpochEnd,
    TrainingEnd,
    CheckpointRestored,
}

impl HookEvent {
    /// Invoke the matching lifecycle method of `hook`
    pub fn dispatch(self, hook: &mut dyn Hook, trainer: &mut Trainer) -> Result<()> {
        match self {
            Self::TrainingStart => hook.on_training_start(trainer),
            Self::EpochStart => hook.on_epoch_start(trainer),
            Self::StepStart => hook.on_step_start(trainer),
            Self::StepEnd => hook.on_step_end(trainer),
            Self::EpochEnd => hook.on_epoch_end(trainer),
            Self::TrainingEnd => hook.on_training_end(trainer),
            Self::CheckpointRestored => hook.on_checkpoint_restored(trainer),
        }
    }

    /// Method name, as used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrainingStart => "on_training_start",
            Self::EpochStart => "on_epoch_start",
            Self::StepStart => "on_step_start",
            Self::StepEnd => "on_step_end",
            Self::EpochEnd => "on_epoch_end",
            Self::TrainingEnd => "on_training_end",
            Self::CheckpointRestored => "on_checkpoint_restored",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
