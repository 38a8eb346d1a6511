//! Loop driver
//!
//! The [`Trainer`] owns the models, optimizers and data sources of a run and
//! drives the epoch/step loop. Everything else (logging, metrics,
//! checkpointing, learning rate scheduling) happens in registered hooks,
//! which are invoked in registration order at every lifecycle point.

use std::fmt;
use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::training::config::TrainerConfig;
use crate::training::context::Context;
use crate::training::data::DataSource;
use crate::training::hooks::{Hook, HookEvent};
use crate::training::model::Model;
use crate::training::optimizers::Optimizer;
use crate::training::parallel::Accelerator;

/// Externally supplied loss computation.
///
/// Reads `ctx.batch` and returns a loss tensor built from the models'
/// variables. It must not mutate anything the loop depends on.
pub trait LossFn: Send {
    /// Compute the loss of the current batch
    fn compute_loss(&mut self, ctx: &Context) -> anyhow::Result<Tensor>;
}

impl<F> LossFn for F
where
    F: FnMut(&Context) -> anyhow::Result<Tensor> + Send,
{
    fn compute_loss(&mut self, ctx: &Context) -> anyhow::Result<Tensor> {
        self(ctx)
    }
}

/// Lifecycle state of a trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerStatus {
    NotStarted,
    Training,
    Finished,
    Failed,
}

/// Hook-orchestrated training loop
pub struct Trainer {
    config: TrainerConfig,
    ctx: Context,
    models: Vec<Box<dyn Model>>,
    optimizers: Vec<Box<dyn Optimizer>>,
    data_loaders: Vec<Box<dyn DataSource>>,
    loss_fn: Box<dyn LossFn>,
    accelerator: Arc<dyn Accelerator>,
    /// A slot is empty while its hook is being invoked
    hooks: Vec<Option<Box<dyn Hook>>>,
    hook_names: Vec<String>,
    active_hook: Option<usize>,
    status: TrainerStatus,
    retain_gradients: bool,
    last_gradients: Option<GradStore>,
}

impl Trainer {
    /// Create a trainer.
    ///
    /// Fails with a configuration error when the config is invalid, when no
    /// data source is given, or when the data sources differ in length.
    pub fn new(
        models: Vec<Box<dyn Model>>,
        optimizers: Vec<Box<dyn Optimizer>>,
        data_loaders: Vec<Box<dyn DataSource>>,
        loss_fn: impl LossFn + 'static,
        accelerator: Arc<dyn Accelerator>,
        config: TrainerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let Some(first) = data_loaders.first() else {
            return Err(Error::config("At least one data loader is required"));
        };
        let expected = first.len();
        if let Some((index, loader)) = data_loaders
            .iter()
            .enumerate()
            .find(|(_, loader)| loader.len() != expected)
        {
            return Err(Error::config(format!(
                "All data loaders must have the same length: loader 0 has {expected} batches, loader {index} has {}",
                loader.len()
            )));
        }

        info!(
            "Creating trainer: {} models, {} optimizers, {} data loaders of {} batches, worker {}/{}",
            models.len(),
            optimizers.len(),
            data_loaders.len(),
            expected,
            accelerator.process_index(),
            accelerator.num_processes()
        );

        Ok(Self {
            ctx: Context::new(config.num_epochs),
            config,
            models,
            optimizers,
            data_loaders,
            loss_fn: Box::new(loss_fn),
            accelerator,
            hooks: Vec::new(),
            hook_names: Vec::new(),
            active_hook: None,
            status: TrainerStatus::NotStarted,
            retain_gradients: false,
            last_gradients: None,
        })
    }

    /// Append a hook; it fires after every hook registered before it
    pub fn register_hook(&mut self, hook: impl Hook) {
        debug!("Registering hook {}", hook.name());
        self.hook_names.push(hook.name().to_string());
        self.hooks.push(Some(Box::new(hook)));
    }

    /// Builder form of [`Trainer::register_hook`]
    pub fn with_hook(mut self, hook: impl Hook) -> Self {
        self.register_hook(hook);
        self
    }

    /// Names of the registered hooks, in invocation order
    pub fn hooks(&self) -> &[String] {
        &self.hook_names
    }

    /// First registered hook of type `T`.
    ///
    /// A hook cannot look itself up while one of its own lifecycle methods
    /// is running.
    pub fn get_hook<T: Hook>(&self) -> Option<&T> {
        self.hooks
            .iter()
            .filter_map(|slot| slot.as_deref())
            .find_map(|hook| hook.as_any().downcast_ref::<T>())
    }

    /// Mutable access to the first registered hook of type `T`
    pub fn get_hook_mut<T: Hook>(&mut self) -> Option<&mut T> {
        self.hooks
            .iter_mut()
            .filter_map(|slot| slot.as_deref_mut())
            .find_map(|hook| hook.as_any_mut().downcast_mut::<T>())
    }

    /// Registration index of the first hook of type `T`
    pub fn hook_position<T: Hook>(&self) -> Option<usize> {
        self.hooks.iter().position(|slot| {
            slot.as_deref()
                .is_some_and(|hook| hook.as_any().downcast_ref::<T>().is_some())
        })
    }

    /// Registration index of the hook currently being invoked
    pub fn active_hook(&self) -> Option<usize> {
        self.active_hook
    }

    /// Loop configuration
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Shared loop state
    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Mutable shared loop state
    pub fn ctx_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn models(&self) -> &[Box<dyn Model>] {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut [Box<dyn Model>] {
        &mut self.models
    }

    pub fn optimizers(&self) -> &[Box<dyn Optimizer>] {
        &self.optimizers
    }

    pub fn optimizers_mut(&mut self) -> &mut [Box<dyn Optimizer>] {
        &mut self.optimizers
    }

    pub fn data_loaders(&self) -> &[Box<dyn DataSource>] {
        &self.data_loaders
    }

    pub fn data_loaders_mut(&mut self) -> &mut [Box<dyn DataSource>] {
        &mut self.data_loaders
    }

    /// Worker group this trainer runs in
    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accelerator
    }

    /// Current lifecycle state
    pub fn status(&self) -> TrainerStatus {
        self.status
    }

    /// Keep the gradients of the latest step for inspection by hooks
    pub fn set_retain_gradients(&mut self, retain: bool) {
        self.retain_gradients = retain;
        if !retain {
            self.last_gradients = None;
        }
    }

    /// Gradients of the latest step of this run, when retained
    pub fn last_gradients(&self) -> Option<&GradStore> {
        self.last_gradients.as_ref()
    }

    /// Run the training loop to completion.
    ///
    /// Step failures and critical hook failures are reported to every hook
    /// through `on_fatal_error` and then returned.
    #[instrument(skip(self), fields(rank = self.accelerator.process_index()))]
    pub fn run(&mut self) -> Result<()> {
        self.status = TrainerStatus::Training;
        self.last_gradients = None;
        self.ctx.reset();
        self.ctx.num_epochs = self.config.num_epochs;

        match self.run_epochs() {
            Ok(()) => {
                self.status = TrainerStatus::Finished;
                info!("Training finished at global step {}", self.ctx.global_step);
                Ok(())
            }
            Err(err) => {
                self.status = TrainerStatus::Failed;
                self.notify_fatal_error(&err);
                Err(err)
            }
        }
    }

    fn run_epochs(&mut self) -> Result<()> {
        // a checkpoint restore may move the starting epoch
        self.call_hooks(HookEvent::TrainingStart)?;

        for epoch in self.ctx.epoch..self.ctx.num_epochs {
            self.run_epoch(epoch)?;
        }

        self.call_hooks(HookEvent::TrainingEnd)
    }

    fn run_epoch(&mut self, epoch: usize) -> Result<()> {
        self.ctx.epoch = epoch;
        let start = self.data_loaders[0].pending_skip();
        for loader in &mut self.data_loaders {
            loader.set_epoch(epoch)?;
        }
        self.ctx.iterator_length = self.data_loaders.iter().map(|loader| loader.len()).max().unwrap_or(0);
        self.ctx.batch_index = start;
        if start > 0 {
            info!("Resuming epoch {} at batch {}", epoch, start);
        }

        self.call_hooks(HookEvent::EpochStart)?;

        for batch_index in start..self.ctx.iterator_length {
            let batch = self.next_batches()?;
            if batch.iter().all(Option::is_none) {
                break;
            }
            self.ctx.batch = batch;
            self.ctx.batch_index = batch_index;
            self.ctx.update_global_step();

            self.call_hooks(HookEvent::StepStart)?;

            let loss = self.training_step().map_err(|source| Error::TrainingStep {
                epoch,
                global_step: self.ctx.global_step,
                source,
            })?;
            self.ctx.step_loss = Some(loss);

            self.call_hooks(HookEvent::StepEnd)?;
        }
        self.ctx.batch.clear();

        self.call_hooks(HookEvent::EpochEnd)
    }

    /// One batch per data source, `None` for sources already exhausted
    fn next_batches(&mut self) -> Result<Vec<Option<Tensor>>> {
        self.data_loaders
            .iter_mut()
            .map(|loader| loader.next_batch().map_err(Error::from))
            .collect()
    }

    /// Run one optimization step on `ctx.batch` and return the loss.
    ///
    /// The phases always run in this order: training mode, zero gradients,
    /// loss, backward, optimizer step.
    pub fn training_step(&mut self) -> anyhow::Result<f64> {
        for model in &mut self.models {
            model.set_training(true);
        }
        for optimizer in &mut self.optimizers {
            optimizer.zero_grad()?;
        }

        let loss = self.loss_fn.compute_loss(&self.ctx)?;
        let grads = loss.backward()?;

        for optimizer in &mut self.optimizers {
            optimizer.step(&grads)?;
        }
        if self.retain_gradients {
            self.last_gradients = Some(grads);
        }

        Ok(loss.mean_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?)
    }

    /// Invoke `on_checkpoint_restored` on every hook except the caller
    pub fn notify_checkpoint_restored(&mut self) -> Result<()> {
        self.call_hooks(HookEvent::CheckpointRestored)
    }

    fn call_hooks(&mut self, event: HookEvent) -> Result<()> {
        let caller = self.active_hook;
        for index in 0..self.hooks.len() {
            let Some(mut hook) = self.hooks[index].take() else {
                continue;
            };
            self.active_hook = Some(index);
            let result = event.dispatch(&mut *hook, self);
            self.active_hook = caller;

            let failure = result.err().map(|err| (hook.name().to_string(), hook.is_critical(), err));
            self.hooks[index] = Some(hook);

            if let Some((name, critical, err)) = failure {
                if critical {
                    return Err(Error::Hook { hook: name, source: err });
                }
                warn!(hook = %name, event = %event, "Hook failed, continuing: {err:#}");
            }
        }
        Ok(())
    }

    fn notify_fatal_error(&mut self, error: &Error) {
        for index in 0..self.hooks.len() {
            if let Some(mut hook) = self.hooks[index].take() {
                hook.on_fatal_error(self, error);
                self.hooks[index] = Some(hook);
            }
        }
    }
}

impl fmt::Display for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Trainer (status: {:?})", self.status)?;
        writeln!(f, "  epochs: {}", self.config.num_epochs)?;
        writeln!(f, "  models: {}", self.models.len())?;
        writeln!(f, "  optimizers: {}", self.optimizers.len())?;
        writeln!(f, "  data loaders: {}", self.data_loaders.len())?;
        write!(f, "  hooks: [{}]", self.hook_names.join(", "))
    }
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("status", &self.status)
            .field("ctx", &self.ctx)
            .field("hooks", &self.hook_names)
            .finish_non_exhaustive()
    }
}
