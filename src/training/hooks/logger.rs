//! Console progress logging

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info};

use super::Hook;
use crate::error::Error;
use crate::training::config::LoggerConfig;
use crate::training::trainer::Trainer;
use crate::utils::memory::{format_bytes, resident_set_bytes};
use crate::utils::timing::{format_hms, DurationEma};

/// Emits progress lines on the coordinating worker.
///
/// The step loss is averaged over all workers first, so every worker must
/// register this hook. Remaining time is estimated from a moving average of
/// the step duration.
#[derive(Debug)]
pub struct LoggerHook {
    config: LoggerConfig,
    step_time: DurationEma,
    step_started: Option<Instant>,
    training_started: Option<Instant>,
    epoch_losses: Vec<f64>,
}

impl LoggerHook {
    pub fn new(config: LoggerConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            step_time: DurationEma::new(config.time_smoothing),
            config,
            step_started: None,
            training_started: None,
            epoch_losses: Vec::new(),
        })
    }

    /// Estimated time until the last step of the run
    pub fn remaining_time(&self, trainer: &Trainer) -> Option<Duration> {
        let ctx = trainer.ctx();
        let total_steps = ctx.num_epochs * ctx.iterator_length;
        let remaining = total_steps.saturating_sub(ctx.global_step + 1);
        self.step_time.get().map(|step| step.mul_f64(remaining as f64))
    }

    fn mean_epoch_loss(&self) -> Option<f64> {
        if self.epoch_losses.is_empty() {
            return None;
        }
        Some(self.epoch_losses.iter().sum::<f64>() / self.epoch_losses.len() as f64)
    }
}

impl Hook for LoggerHook {
    fn name(&self) -> &str {
        "LoggerHook"
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn on_training_start(&mut self, trainer: &mut Trainer) -> Result<()> {
        self.training_started = Some(Instant::now());
        self.step_time.reset();
        if trainer.accelerator().is_main_process() {
            info!(
                "Training started: {} epochs, {} workers, hooks [{}]",
                trainer.config().num_epochs,
                trainer.accelerator().num_processes(),
                trainer.hooks().join(", ")
            );
        }
        Ok(())
    }

    fn on_checkpoint_restored(&mut self, trainer: &mut Trainer) -> Result<()> {
        if trainer.accelerator().is_main_process() {
            let ctx = trainer.ctx();
            info!("Resuming from epoch {}, global step {}", ctx.epoch, ctx.global_step);
        }
        Ok(())
    }

    fn on_epoch_start(&mut self, trainer: &mut Trainer) -> Result<()> {
        self.epoch_losses.clear();
        if trainer.accelerator().is_main_process() {
            let ctx = trainer.ctx();
            info!(
                "Epoch {}/{} started ({} steps)",
                ctx.epoch + 1,
                ctx.num_epochs,
                ctx.iterator_length
            );
        }
        Ok(())
    }

    fn on_step_start(&mut self, _trainer: &mut Trainer) -> Result<()> {
        self.step_started = Some(Instant::now());
        Ok(())
    }

    fn on_step_end(&mut self, trainer: &mut Trainer) -> Result<()> {
        if let Some(started) = self.step_started.take() {
            self.step_time.update(started.elapsed());
        }

        // collective: every worker takes part regardless of rank
        let local_loss = trainer.ctx().step_loss.unwrap_or(f64::NAN);
        let loss = trainer.accelerator().reduce_mean(local_loss);
        self.epoch_losses.push(loss);

        if !trainer.accelerator().is_main_process() {
            return Ok(());
        }
        let ctx = trainer.ctx();
        let last_step = ctx.batch_index + 1 == ctx.iterator_length;
        if (ctx.batch_index + 1) % self.config.interval != 0 && !last_step {
            return Ok(());
        }

        let progress = 100.0 * (ctx.batch_index + 1) as f64 / ctx.iterator_length.max(1) as f64;
        let eta = self
            .remaining_time(trainer)
            .map(format_hms)
            .unwrap_or_else(|| "--:--:--".to_string());
        let lr = trainer
            .optimizers()
            .first()
            .map(|optimizer| format!("{:.3e}", optimizer.learning_rate()))
            .unwrap_or_else(|| "n/a".to_string());
        let memory = resident_set_bytes()
            .map(format_bytes)
            .unwrap_or_else(|| "n/a".to_string());

        info!(
            "Epoch {}/{} | Step {}/{} ({:.1}%) | global step {} | loss {:.6} | lr {} | eta {} | mem {}",
            ctx.epoch + 1,
            ctx.num_epochs,
            ctx.batch_index + 1,
            ctx.iterator_length,
            progress,
            ctx.global_step,
            loss,
            lr,
            eta,
            memory
        );
        Ok(())
    }

    fn on_epoch_end(&mut self, trainer: &mut Trainer) -> Result<()> {
        if !trainer.accelerator().is_main_process() {
            return Ok(());
        }
        let epoch = trainer.ctx().epoch + 1;
        match self.mean_epoch_loss() {
            Some(mean) => info!("Epoch {} finished, mean loss {:.6}", epoch, mean),
            None => info!("Epoch {} finished, no steps run", epoch),
        }
        Ok(())
    }

    fn on_training_end(&mut self, trainer: &mut Trainer) -> Result<()> {
        if trainer.accelerator().is_main_process() {
            let elapsed = self.training_started.map(|started| started.elapsed()).unwrap_or_default();
            info!(
                "Training finished after {} at global step {}",
                format_hms(elapsed),
                trainer.ctx().global_step
            );
        }
        Ok(())
    }

    fn on_fatal_error(&mut self, trainer: &mut Trainer, error: &Error) {
        error!(
            rank = trainer.accelerator().process_index(),
            "Training aborted at epoch {}, global step {}: {error}",
            trainer.ctx().epoch,
            trainer.ctx().global_step
        );
    }
}
