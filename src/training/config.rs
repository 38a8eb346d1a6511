//! Training configuration system
//!
//! Every component of a run has a serde configuration struct with sensible
//! defaults and a `validate` method. Validation failures are configuration
//! errors and are raised at construction time, never mid-run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};

/// Complete configuration of a training run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Loop driver settings
    pub trainer: TrainerConfig,

    /// Data loading settings
    pub data: DataLoaderConfig,

    /// Optimizer settings
    pub optimizer: OptimizerConfig,

    /// Checkpointing settings
    pub checkpoint: CheckpointConfig,

    /// Console logging settings
    pub logger: LoggerConfig,

    /// Metric recording settings, disabled when absent
    pub metrics: Option<MetricConfig>,

    /// Learning rate schedule, disabled when absent
    pub lr_scheduler: Option<LrSchedulerConfig>,
}

impl RunConfig {
    /// Load configuration from a JSON or YAML file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| Error::config(format!("Invalid YAML in {}: {e}", path.display())))?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.trainer.validate()?;
        self.data.validate()?;
        self.optimizer.validate()?;
        self.checkpoint.validate()?;
        self.logger.validate()?;
        if let Some(metrics) = &self.metrics {
            metrics.validate()?;
        }
        if let Some(lr_scheduler) = &self.lr_scheduler {
            lr_scheduler.scheduler.validate()?;
        }
        Ok(())
    }

    /// Register every section for the start-of-run configuration dump
    pub fn register_all(&self, registry: &mut ConfigRegistry) -> Result<()> {
        registry.register("TrainerConfig", &self.trainer)?;
        registry.register("DataLoaderConfig", &self.data)?;
        registry.register("OptimizerConfig", &self.optimizer)?;
        registry.register("CheckpointConfig", &self.checkpoint)?;
        registry.register("LoggerConfig", &self.logger)?;
        if let Some(metrics) = &self.metrics {
            registry.register("MetricConfig", metrics)?;
        }
        if let Some(lr_scheduler) = &self.lr_scheduler {
            registry.register("LrSchedulerConfig", lr_scheduler)?;
        }
        Ok(())
    }
}

/// Loop driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Number of epochs to run
    pub num_epochs: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self { num_epochs: 100 }
    }
}

impl TrainerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(Error::config("num_epochs must be > 0"));
        }
        Ok(())
    }
}

/// Data loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Samples per batch
    pub batch_size: usize,

    /// Whether to shuffle data every epoch
    pub shuffle: bool,

    /// Base seed of the per-epoch shuffle
    pub seed: u64,

    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            seed: 42,
            drop_last: false,
        }
    }
}

impl DataLoaderConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        Ok(())
    }
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Base learning rate
    pub learning_rate: f64,

    /// Momentum coefficient
    pub momentum: f64,

    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            momentum: 0.9,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(Error::config("learning_rate must be > 0"));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::config("momentum must be in [0, 1)"));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::config("weight_decay must be >= 0"));
        }
        Ok(())
    }
}

/// Checkpointing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Root folder holding one sub-directory per checkpoint
    pub folder_path: PathBuf,

    /// Write a checkpoint every `interval` global steps
    pub interval: usize,

    /// Keep only the newest N checkpoints; unbounded when `None`
    pub max_to_keep: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            folder_path: PathBuf::from("checkpoints"),
            interval: 100,
            max_to_keep: None,
        }
    }
}

impl CheckpointConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(Error::config("Checkpoint interval must be greater than 0"));
        }
        if self.max_to_keep == Some(0) {
            return Err(Error::config("max_to_keep must be > 0 when set"));
        }
        if self.folder_path.as_os_str().is_empty() {
            return Err(Error::config("Checkpoint folder path must not be empty"));
        }
        Ok(())
    }
}

/// Console logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Log every `interval` steps within an epoch
    pub interval: usize,

    /// Smoothing factor of the step-time moving average, in (0, 1]
    pub time_smoothing: f64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            interval: 1,
            time_smoothing: 0.1,
        }
    }
}

impl LoggerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(Error::config("Logger interval must be greater than 0"));
        }
        if !(self.time_smoothing > 0.0 && self.time_smoothing <= 1.0) {
            return Err(Error::config("time_smoothing must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Metric recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    /// Folder receiving `metrics.jsonl`
    pub folder_path: PathBuf,

    /// Record every `interval` global steps
    pub interval: usize,

    /// Also record per-variable parameter and gradient summaries at the end
    /// of every epoch
    #[serde(default)]
    pub record_parameters: bool,
}

impl MetricConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(Error::config("Metric interval must be greater than 0"));
        }
        if self.folder_path.as_os_str().is_empty() {
            return Err(Error::config("Metric folder path must not be empty"));
        }
        Ok(())
    }
}

/// When the learning rate schedule advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Once per completed step
    PerStep,
    /// Once per completed epoch
    PerEpoch,
}

/// Learning rate schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrSchedulerConfig {
    /// When the schedule advances
    pub mode: SchedulerMode,

    /// Shape of the schedule
    pub scheduler: SchedulerConfig,
}

/// Learning rate scheduler types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    Constant,
    Linear,
    Cosine,
    Exponential,
    Step,
}

/// Learning rate scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler type
    pub scheduler_type: SchedulerType,

    /// Positions of the schedule (for linear and cosine decay)
    pub total_steps: usize,

    /// Warmup positions
    pub warmup_steps: usize,

    /// Positions between decays for the step scheduler
    pub step_size: usize,

    /// Decay factor for step/exponential schedulers
    pub decay_factor: f64,

    /// Minimum learning rate
    pub min_lr: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_type: SchedulerType::Constant,
            total_steps: 1000,
            warmup_steps: 0,
            step_size: 100,
            decay_factor: 0.1,
            min_lr: 0.0,
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.scheduler_type {
            SchedulerType::Linear | SchedulerType::Cosine if self.total_steps <= self.warmup_steps => {
                Err(Error::config("total_steps must exceed warmup_steps"))
            }
            SchedulerType::Step if self.step_size == 0 => Err(Error::config("step_size must be > 0")),
            SchedulerType::Exponential | SchedulerType::Step if self.decay_factor <= 0.0 => {
                Err(Error::config("decay_factor must be > 0"))
            }
            _ if self.min_lr < 0.0 => Err(Error::config("min_lr must be >= 0")),
            _ => Ok(()),
        }
    }
}

/// Explicit registry of configuration summaries, logged once at startup
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    entries: BTreeMap<String, Value>,
}

impl ConfigRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a configuration under `name`, replacing any previous entry
    pub fn register<T: Serialize>(&mut self, name: impl Into<String>, config: &T) -> Result<()> {
        self.entries.insert(name.into(), serde_json::to_value(config)?);
        Ok(())
    }

    /// Registered configurations by name
    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    /// Log every registered configuration
    pub fn log_all(&self) {
        for (name, value) in &self.entries {
            info!(config = %name, "{}", value);
        }
    }
}
