//! Periodic checkpointing and exact resumption
//!
//! Every `interval` steps the coordinating worker writes the loop context,
//! every model and optimizer, the learning rate schedule and the number of
//! batches each data source has consumed in the current epoch. At training
//! start the newest checkpoint that fully deserializes is restored and each
//! data source is told to skip the batches it had already produced, so the
//! run continues exactly where the checkpointed run was. A checkpoint that
//! fails to apply is skipped in favour of the next older one.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Hook, LrSchedulerHook};
use crate::error::Error;
use crate::training::checkpoints::{CheckpointInfo, CheckpointManifest, CheckpointStore};
use crate::training::config::CheckpointConfig;
use crate::training::context::Context;
use crate::training::optimizers::schedulers::SchedulerStateDict;
use crate::training::optimizers::OptimizerStateDict;
use crate::training::parallel::Accelerator;
use crate::training::trainer::Trainer;
use crate::utils::io;

const CONTEXT_FILE: &str = "context.json";
const DATA_STATE_FILE: &str = "data_state.json";
const LR_SCHEDULER_FILE: &str = "lr_scheduler.json";

fn model_file(index: usize) -> String {
    format!("model_{index}.safetensors")
}

fn optimizer_file(index: usize) -> String {
    format!("optimizer_{index}.bin")
}

/// Data iteration position at the time of a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataState {
    /// Epoch the counters refer to
    pub epoch: usize,

    /// Batches consumed by each data source within that epoch
    pub consumed: Vec<usize>,
}

/// Fully deserialized checkpoint, ready to be applied
struct Snapshot {
    info: CheckpointInfo,
    context: Context,
    data_state: DataState,
    optimizers: Vec<OptimizerStateDict>,
    lr_scheduler: Option<SchedulerStateDict>,
}

/// Writes checkpoints at a fixed step interval and restores the newest
/// valid one when training starts.
#[derive(Debug)]
pub struct CheckpointHook {
    config: CheckpointConfig,
    store: CheckpointStore,
    restored_from: Option<CheckpointInfo>,
    last_saved: Option<CheckpointInfo>,
}

impl CheckpointHook {
    /// Create the hook; fails on an invalid configuration
    pub fn new(config: CheckpointConfig) -> crate::Result<Self> {
        config.validate()?;
        let store = CheckpointStore::new(&config.folder_path);
        Ok(Self {
            config,
            store,
            restored_from: None,
            last_saved: None,
        })
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Checkpoint restored at the last training start, if any
    pub fn restored_from(&self) -> Option<&CheckpointInfo> {
        self.restored_from.as_ref()
    }

    /// Most recently written checkpoint
    pub fn last_saved(&self) -> Option<&CheckpointInfo> {
        self.last_saved.as_ref()
    }

    fn check_hook_order(&self, trainer: &Trainer) {
        let (Some(scheduler), Some(this)) = (trainer.hook_position::<LrSchedulerHook>(), trainer.active_hook())
        else {
            return;
        };
        if scheduler > this {
            warn!(
                "LrSchedulerHook is registered after CheckpointHook; checkpoints will hold a schedule \
                 position one advance behind the optimizers"
            );
        }
    }

    /// Read and check everything a checkpoint holds without touching the trainer
    fn read_snapshot(
        &self,
        trainer: &Trainer,
        info: &CheckpointInfo,
        manifest: &CheckpointManifest,
    ) -> crate::Result<Snapshot> {
        let corrupt = |reason: String| Error::checkpoint_corruption(&info.path, reason);

        let context: Context = io::read_json(info.file(CONTEXT_FILE))
            .map_err(|err| corrupt(format!("context: {err:#}")))?;
        let data_state: DataState = io::read_json(info.file(DATA_STATE_FILE))
            .map_err(|err| corrupt(format!("data state: {err:#}")))?;
        if data_state.consumed.len() != trainer.data_loaders().len() {
            return Err(corrupt(format!(
                "{} data source counters for {} data sources",
                data_state.consumed.len(),
                trainer.data_loaders().len()
            )));
        }
        if data_state.epoch != context.epoch {
            return Err(corrupt(format!(
                "data state refers to epoch {} but the context to epoch {}",
                data_state.epoch, context.epoch
            )));
        }

        let stored_models = manifest.files.iter().filter(|file| file.starts_with("model_")).count();
        if stored_models != trainer.models().len() {
            return Err(corrupt(format!(
                "{stored_models} stored models for {} models",
                trainer.models().len()
            )));
        }
        for (index, model) in trainer.models().iter().enumerate() {
            model
                .verify(&info.file(&model_file(index)))
                .map_err(|err| corrupt(format!("model {index}: {err:#}")))?;
        }

        let stored_optimizers = manifest.files.iter().filter(|file| file.starts_with("optimizer_")).count();
        if stored_optimizers != trainer.optimizers().len() {
            return Err(corrupt(format!(
                "{stored_optimizers} stored optimizers for {} optimizers",
                trainer.optimizers().len()
            )));
        }
        let optimizers = (0..trainer.optimizers().len())
            .map(|index| {
                std::fs::read(info.file(&optimizer_file(index)))
                    .map_err(anyhow::Error::from)
                    .and_then(|bytes| OptimizerStateDict::from_bytes(&bytes))
                    .map_err(|err| corrupt(format!("optimizer {index}: {err:#}")))
            })
            .collect::<crate::Result<Vec<_>>>()?;

        let lr_scheduler = if manifest.files.iter().any(|file| file == LR_SCHEDULER_FILE) {
            let state = io::read_json(info.file(LR_SCHEDULER_FILE))
                .map_err(|err| corrupt(format!("lr scheduler: {err:#}")))?;
            Some(state)
        } else {
            None
        };

        Ok(Snapshot {
            info: info.clone(),
            context,
            data_state,
            optimizers,
            lr_scheduler,
        })
    }

    /// Load a snapshot into the trainer. Parameters, optimizer state and the
    /// schedule go first; the loop position is only touched once they all
    /// loaded.
    fn apply_snapshot(&self, trainer: &mut Trainer, snapshot: Snapshot) -> Result<()> {
        let Snapshot {
            info,
            context,
            data_state,
            optimizers,
            lr_scheduler,
        } = snapshot;

        for (index, model) in trainer.models_mut().iter_mut().enumerate() {
            model.load(&info.file(&model_file(index)))?;
        }
        for (optimizer, state) in trainer.optimizers_mut().iter_mut().zip(optimizers) {
            optimizer.load_state_dict(state)?;
        }

        let restored_lr = match lr_scheduler {
            Some(state) => match trainer.get_hook_mut::<LrSchedulerHook>() {
                Some(hook) => {
                    hook.load_state_dict(state).context("Failed to restore learning rate schedule")?;
                    Some(hook.learning_rate())
                }
                None => {
                    debug!("Ignoring stored learning rate schedule, no LrSchedulerHook registered");
                    None
                }
            },
            None => {
                if trainer.hook_position::<LrSchedulerHook>().is_some() {
                    warn!(
                        "Checkpoint {} holds no learning rate schedule, keeping the fresh one",
                        info.path.display()
                    );
                }
                None
            }
        };
        if let Some(lr) = restored_lr {
            for optimizer in trainer.optimizers_mut() {
                optimizer.set_learning_rate(lr);
            }
        }

        let num_epochs = trainer.config().num_epochs;
        *trainer.ctx_mut() = context;
        trainer.ctx_mut().num_epochs = num_epochs;
        for (loader, consumed) in trainer.data_loaders_mut().iter_mut().zip(&data_state.consumed) {
            loader.skip_batches(*consumed);
        }

        info!(
            "Restored checkpoint {} (epoch {}, global step {}, skipping {:?} batches)",
            info.path.display(),
            trainer.ctx().epoch,
            trainer.ctx().global_step,
            data_state.consumed
        );
        Ok(())
    }

    fn restore(&mut self, trainer: &mut Trainer) -> Result<()> {
        // set once a failed apply may have overwritten live parameters
        let mut damaged: Option<anyhow::Error> = None;
        for (info, manifest) in self.store.valid_candidates()? {
            let snapshot = match self.read_snapshot(trainer, &info, &manifest) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!("Skipping checkpoint: {err}");
                    continue;
                }
            };
            match self.apply_snapshot(trainer, snapshot) {
                Ok(()) => {
                    self.restored_from = Some(info);
                    return Ok(());
                }
                Err(err) => {
                    warn!("Skipping checkpoint {}, failed to apply: {err:#}", info.path.display());
                    damaged = Some(err);
                }
            }
        }
        if let Some(err) = damaged {
            return Err(err.context(format!(
                "No checkpoint in {} could be applied and the model state was partially overwritten",
                self.store.root().display()
            )));
        }
        info!("No checkpoint found in {}, starting fresh", self.store.root().display());
        Ok(())
    }

    fn write_payload(trainer: &Trainer, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(CONTEXT_FILE), trainer.ctx().to_json()?)?;

        for (index, model) in trainer.models().iter().enumerate() {
            model.save(&dir.join(model_file(index)))?;
        }
        for (index, optimizer) in trainer.optimizers().iter().enumerate() {
            std::fs::write(dir.join(optimizer_file(index)), optimizer.state_dict()?.to_bytes()?)?;
        }

        let data_state = DataState {
            epoch: trainer.ctx().epoch,
            consumed: trainer.data_loaders().iter().map(|loader| loader.consumed()).collect(),
        };
        io::write_json(dir.join(DATA_STATE_FILE), &data_state)?;

        if let Some(hook) = trainer.get_hook::<LrSchedulerHook>() {
            io::write_json(dir.join(LR_SCHEDULER_FILE), &hook.state_dict())?;
        }
        Ok(())
    }

    fn save(&mut self, trainer: &Trainer, step: usize) -> Result<()> {
        let info = self
            .store
            .save(step, trainer.ctx().epoch, |dir| Self::write_payload(trainer, dir))?;
        self.last_saved = Some(info);

        if let Some(max_to_keep) = self.config.max_to_keep {
            self.store.prune(max_to_keep)?;
        }
        Ok(())
    }
}

impl Hook for CheckpointHook {
    fn name(&self) -> &str {
        "CheckpointHook"
    }

    fn on_training_start(&mut self, trainer: &mut Trainer) -> Result<()> {
        self.check_hook_order(trainer);
        let accelerator: Arc<dyn Accelerator> = Arc::clone(trainer.accelerator());

        let cleaned = if accelerator.is_main_process() {
            self.store.clean_stale().map(|_| ()).map_err(anyhow::Error::from)
        } else {
            Ok(())
        };
        agree(accelerator.as_ref(), cleaned, "Stale checkpoint cleanup")?;

        self.restored_from = None;
        let restored = self.restore(trainer);
        agree(accelerator.as_ref(), restored, "Checkpoint restore")?;

        if self.restored_from.is_some() {
            trainer.notify_checkpoint_restored()?;
        }
        Ok(())
    }

    fn on_step_end(&mut self, trainer: &mut Trainer) -> Result<()> {
        let step = trainer.ctx().global_step + 1;
        if step % self.config.interval != 0 {
            return Ok(());
        }

        let accelerator: Arc<dyn Accelerator> = Arc::clone(trainer.accelerator());
        accelerator.wait_for_everyone();
        let saved = if accelerator.is_main_process() {
            self.save(trainer, step)
        } else {
            Ok(())
        };
        agree(accelerator.as_ref(), saved, "Checkpoint write")
    }

    fn on_fatal_error(&mut self, _trainer: &mut Trainer, _error: &Error) {
        match &self.last_saved {
            Some(info) => info!("Latest checkpoint of the failed run: {}", info.path.display()),
            None => debug!("Failed run wrote no checkpoint"),
        }
    }
}

/// Collective: fails on every worker if `outcome` failed on any of them
fn agree(accelerator: &dyn Accelerator, outcome: Result<()>, action: &str) -> Result<()> {
    let failed_on = accelerator.first_failure(outcome.is_ok());
    outcome?;
    match failed_on {
        Some(rank) => anyhow::bail!("{action} failed on worker {rank}"),
        None => Ok(()),
    }
}
