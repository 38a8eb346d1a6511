//! Learning rate scheduling hook

use anyhow::Result;
use tracing::{debug, info};

use super::Hook;
use crate::error::Error;
use crate::training::config::{LrSchedulerConfig, SchedulerMode};
use crate::training::optimizers::schedulers::{create_scheduler, Scheduler, SchedulerStateDict};
use crate::training::optimizers::Optimizer;
use crate::training::trainer::Trainer;

/// Advances a learning rate schedule after every step or every epoch and
/// writes the resulting rate into every optimizer.
///
/// Register it before the [`CheckpointHook`](super::CheckpointHook): the
/// schedule position is saved and restored with each checkpoint, and must
/// already include the step the checkpoint is written at.
///
/// Each run starts the schedule from the beginning unless a position was
/// restored into the hook for that run.
pub struct LrSchedulerHook {
    scheduler: Box<dyn Scheduler>,
    mode: SchedulerMode,
    /// A position was loaded for the current run
    restored: bool,
}

impl LrSchedulerHook {
    pub fn new(scheduler: Box<dyn Scheduler>, mode: SchedulerMode) -> Self {
        Self {
            scheduler,
            mode,
            restored: false,
        }
    }

    /// Build the hook from configuration
    pub fn from_config(config: &LrSchedulerConfig, base_lr: f64) -> crate::Result<Self> {
        let scheduler = create_scheduler(&config.scheduler, base_lr)?;
        Ok(Self::new(scheduler, config.mode))
    }

    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    /// Learning rate at the current schedule position
    pub fn learning_rate(&self) -> f64 {
        self.scheduler.get_lr()
    }

    /// Schedule position, for checkpointing
    pub fn state_dict(&self) -> SchedulerStateDict {
        self.scheduler.state_dict()
    }

    /// Restore the schedule position. Optimizers are not touched.
    pub fn load_state_dict(&mut self, state: SchedulerStateDict) -> Result<()> {
        self.scheduler.load_state_dict(state)?;
        self.restored = true;
        Ok(())
    }

    fn apply(&self, optimizers: &mut [Box<dyn Optimizer>]) {
        let lr = self.scheduler.get_lr();
        for optimizer in optimizers {
            optimizer.set_learning_rate(lr);
        }
    }

    fn advance(&mut self, trainer: &mut Trainer) {
        let was_done = self.scheduler.is_done();
        self.scheduler.step();
        self.apply(trainer.optimizers_mut());
        debug!(
            "Scheduler {} at position {}, lr={:.6e}",
            self.scheduler.name(),
            self.scheduler.step_count(),
            self.scheduler.get_lr()
        );
        if !was_done && self.scheduler.is_done() {
            info!(
                "Learning rate schedule {} finished at position {}, holding lr={:.6e}",
                self.scheduler.name(),
                self.scheduler.step_count(),
                self.scheduler.get_lr()
            );
        }
    }
}

impl Hook for LrSchedulerHook {
    fn name(&self) -> &str {
        "LrSchedulerHook"
    }

    fn on_training_start(&mut self, trainer: &mut Trainer) -> Result<()> {
        // a CheckpointHook registered earlier may already have restored us
        if !self.restored {
            self.scheduler.reset();
        }
        self.apply(trainer.optimizers_mut());
        Ok(())
    }

    fn on_step_end(&mut self, trainer: &mut Trainer) -> Result<()> {
        if self.mode == SchedulerMode::PerStep {
            self.advance(trainer);
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, trainer: &mut Trainer) -> Result<()> {
        if self.mode == SchedulerMode::PerEpoch {
            self.advance(trainer);
        }
        Ok(())
    }

    fn on_training_end(&mut self, _trainer: &mut Trainer) -> Result<()> {
        self.restored = false;
        Ok(())
    }

    fn on_fatal_error(&mut self, _trainer: &mut Trainer, _error: &Error) {
        self.restored = false;
    }
}

impl std::fmt::Debug for LrSchedulerHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LrSchedulerHook")
            .field("scheduler", &self.scheduler.name())
            .field("mode", &self.mode)
            .field("position", &self.scheduler.step_count())
            .field("done", &self.scheduler.is_done())
            .finish()
    }
}
