//! Learning rate schedulers
//!
//! Linear, cosine, exponential and step-based schedules with optional linear
//! warmup. Every schedule is a pure function of its step counter, so the
//! saved state dict fully determines the remaining trajectory.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::training::config::{SchedulerConfig, SchedulerType};

/// Trait for learning rate schedulers
pub trait Scheduler: Send {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Advance the schedule by one position
    fn step(&mut self);

    /// Get current learning rate
    fn get_lr(&self) -> f64;

    /// Number of times `step` was called
    fn step_count(&self) -> usize;

    /// Get scheduler state for checkpointing
    fn state_dict(&self) -> SchedulerStateDict;

    /// Load scheduler state from checkpoint
    fn load_state_dict(&mut self, state: SchedulerStateDict) -> Result<()>;

    /// Check if scheduler is done (for finite schedules)
    fn is_done(&self) -> bool {
        false
    }

    /// Reset scheduler to initial state
    fn reset(&mut self);
}

/// Scheduler state dictionary for checkpointing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateDict {
    /// Scheduler type
    pub scheduler_type: String,

    /// Current step count
    pub step_count: usize,

    /// Current learning rate
    pub current_lr: f64,

    /// Base learning rate
    pub base_lr: f64,

    /// Hyperparameters
    pub hyperparameters: BTreeMap<String, f64>,
}

/// Shared bookkeeping for the warmup-then-decay schedules
#[derive(Debug, Clone)]
struct Position {
    base_lr: f64,
    warmup_steps: usize,
    current_step: usize,
    current_lr: f64,
}

impl Position {
    fn new(base_lr: f64, warmup_steps: usize) -> Self {
        let mut position = Self {
            base_lr,
            warmup_steps,
            current_step: 0,
            current_lr: base_lr,
        };
        if warmup_steps > 0 {
            position.current_lr = 0.0;
        }
        position
    }

    /// Learning rate during warmup, `None` once warmup is over
    fn warmup_lr(&self) -> Option<f64> {
        (self.current_step < self.warmup_steps)
            .then(|| self.base_lr * (self.current_step as f64 / self.warmup_steps as f64))
    }

    fn state_dict(&self, scheduler_type: &str, hyperparameters: BTreeMap<String, f64>) -> SchedulerStateDict {
        SchedulerStateDict {
            scheduler_type: scheduler_type.to_string(),
            step_count: self.current_step,
            current_lr: self.current_lr,
            base_lr: self.base_lr,
            hyperparameters,
        }
    }

    fn load(&mut self, scheduler_type: &str, state_dict: &SchedulerStateDict) -> Result<()> {
        anyhow::ensure!(
            state_dict.scheduler_type == scheduler_type,
            "cannot load '{}' scheduler state into a '{}' scheduler",
            state_dict.scheduler_type,
            scheduler_type
        );
        self.current_step = state_dict.step_count;
        self.current_lr = state_dict.current_lr;
        self.base_lr = state_dict.base_lr;
        Ok(())
    }

    fn reset(&mut self) {
        *self = Self::new(self.base_lr, self.warmup_steps);
    }
}

/// Linear learning rate scheduler
pub struct LinearScheduler {
    position: Position,
    min_lr: f64,
    total_steps: usize,
}

impl LinearScheduler {
    /// Create a new linear scheduler
    pub fn new(base_lr: f64, min_lr: f64, total_steps: usize, warmup_steps: usize) -> Self {
        Self {
            position: Position::new(base_lr, warmup_steps),
            min_lr,
            total_steps: total_steps.max(warmup_steps + 1),
        }
    }

    fn calculate_lr(&self) -> f64 {
        let p = &self.position;
        p.warmup_lr().unwrap_or_else(|| {
            let decay_steps = self.total_steps - p.warmup_steps;
            let progress = (p.current_step - p.warmup_steps) as f64 / decay_steps as f64;
            self.min_lr + (p.base_lr - self.min_lr) * (1.0 - progress.min(1.0))
        })
    }
}

impl Scheduler for LinearScheduler {
    fn name(&self) -> &str {
        "linear"
    }

    fn step(&mut self) {
        self.position.current_step += 1;
        self.position.current_lr = self.calculate_lr();
    }

    fn get_lr(&self) -> f64 {
        self.position.current_lr
    }

    fn step_count(&self) -> usize {
        self.position.current_step
    }

    fn state_dict(&self) -> SchedulerStateDict {
        let hyperparameters = BTreeMap::from([
            ("min_lr".to_string(), self.min_lr),
            ("total_steps".to_string(), self.total_steps as f64),
            ("warmup_steps".to_string(), self.position.warmup_steps as f64),
        ]);
        self.position.state_dict("linear", hyperparameters)
    }

    fn load_state_dict(&mut self, state_dict: SchedulerStateDict) -> Result<()> {
        self.position.load("linear", &state_dict)?;
        if let Some(&min_lr) = state_dict.hyperparameters.get("min_lr") {
            self.min_lr = min_lr;
        }
        if let Some(&total_steps) = state_dict.hyperparameters.get("total_steps") {
            self.total_steps = total_steps as usize;
        }
        if let Some(&warmup_steps) = state_dict.hyperparameters.get("warmup_steps") {
            self.position.warmup_steps = warmup_steps as usize;
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.position.current_step >= self.total_steps
    }

    fn reset(&mut self) {
        self.position.reset();
    }
}

/// Cosine annealing learning rate scheduler
pub struct CosineScheduler {
    position: Position,
    min_lr: f64,
    total_steps: usize,
}

impl CosineScheduler {
    /// Create a new cosine scheduler
    pub fn new(base_lr: f64, min_lr: f64, total_steps: usize, warmup_steps: usize) -> Self {
        Self {
            position: Position::new(base_lr, warmup_steps),
            min_lr,
            total_steps: total_steps.max(warmup_steps + 1),
        }
    }

    fn calculate_lr(&self) -> f64 {
        let p = &self.position;
        p.warmup_lr().unwrap_or_else(|| {
            let decay_steps = self.total_steps - p.warmup_steps;
            let progress = (p.current_step - p.warmup_steps) as f64 / decay_steps as f64;
            let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress.min(1.0)).cos());
            self.min_lr + (p.base_lr - self.min_lr) * cosine
        })
    }
}

impl Scheduler for CosineScheduler {
    fn name(&self) -> &str {
        "cosine"
    }

    fn step(&mut self) {
        self.position.current_step += 1;
        self.position.current_lr = self.calculate_lr();
    }

    fn get_lr(&self) -> f64 {
        self.position.current_lr
    }

    fn step_count(&self) -> usize {
        self.position.current_step
    }

    fn state_dict(&self) -> SchedulerStateDict {
        let hyperparameters = BTreeMap::from([
            ("min_lr".to_string(), self.min_lr),
            ("total_steps".to_string(), self.total_steps as f64),
            ("warmup_steps".to_string(), self.position.warmup_steps as f64),
        ]);
        self.position.state_dict("cosine", hyperparameters)
    }

    fn load_state_dict(&mut self, state_dict: SchedulerStateDict) -> Result<()> {
        self.position.load("cosine", &state_dict)?;
        if let Some(&min_lr) = state_dict.hyperparameters.get("min_lr") {
            self.min_lr = min_lr;
        }
        if let Some(&total_steps) = state_dict.hyperparameters.get("total_steps") {
            self.total_steps = total_steps as usize;
        }
        if let Some(&warmup_steps) = state_dict.hyperparameters.get("warmup_steps") {
            self.position.warmup_steps = warmup_steps as usize;
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.position.current_step >= self.total_steps
    }

    fn reset(&mut self) {
        self.position.reset();
    }
}

/// Exponential learning rate scheduler
pub struct ExponentialScheduler {
    position: Position,
    decay_factor: f64,
}

impl ExponentialScheduler {
    /// Create a new exponential scheduler
    pub fn new(base_lr: f64, decay_factor: f64, warmup_steps: usize) -> Self {
        Self {
            position: Position::new(base_lr, warmup_steps),
            decay_factor,
        }
    }

    fn calculate_lr(&self) -> f64 {
        let p = &self.position;
        p.warmup_lr().unwrap_or_else(|| {
            let decay_steps = p.current_step - p.warmup_steps;
            p.base_lr * self.decay_factor.powi(decay_steps as i32)
        })
    }
}

impl Scheduler for ExponentialScheduler {
    fn name(&self) -> &str {
        "exponential"
    }

    fn step(&mut self) {
        self.position.current_step += 1;
        self.position.current_lr = self.calculate_lr();
    }

    fn get_lr(&self) -> f64 {
        self.position.current_lr
    }

    fn step_count(&self) -> usize {
        self.position.current_step
    }

    fn state_dict(&self) -> SchedulerStateDict {
        let hyperparameters = BTreeMap::from([
            ("decay_factor".to_string(), self.decay_factor),
            ("warmup_steps".to_string(), self.position.warmup_steps as f64),
        ]);
        self.position.state_dict("exponential", hyperparameters)
    }

    fn load_state_dict(&mut self, state_dict: SchedulerStateDict) -> Result<()> {
        self.position.load("exponential", &state_dict)?;
        if let Some(&decay_factor) = state_dict.hyperparameters.get("decay_factor") {
            self.decay_factor = decay_factor;
        }
        if let Some(&warmup_steps) = state_dict.hyperparameters.get("warmup_steps") {
            self.position.warmup_steps = warmup_steps as usize;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.position.reset();
    }
}

/// Step learning rate scheduler
pub struct StepScheduler {
    position: Position,
    step_size: usize,
    decay_factor: f64,
}

impl StepScheduler {
    /// Create a new step scheduler
    pub fn new(base_lr: f64, step_size: usize, decay_factor: f64, warmup_steps: usize) -> Self {
        Self {
            position: Position::new(base_lr, warmup_steps),
            step_size: step_size.max(1),
            decay_factor,
        }
    }

    fn calculate_lr(&self) -> f64 {
        let p = &self.position;
        p.warmup_lr().unwrap_or_else(|| {
            let decays = (p.current_step - p.warmup_steps) / self.step_size;
            p.base_lr * self.decay_factor.powi(decays as i32)
        })
    }
}

impl Scheduler for StepScheduler {
    fn name(&self) -> &str {
        "step"
    }

    fn step(&mut self) {
        self.position.current_step += 1;
        self.position.current_lr = self.calculate_lr();
    }

    fn get_lr(&self) -> f64 {
        self.position.current_lr
    }

    fn step_count(&self) -> usize {
        self.position.current_step
    }

    fn state_dict(&self) -> SchedulerStateDict {
        let hyperparameters = BTreeMap::from([
            ("decay_factor".to_string(), self.decay_factor),
            ("step_size".to_string(), self.step_size as f64),
            ("warmup_steps".to_string(), self.position.warmup_steps as f64),
        ]);
        self.position.state_dict("step", hyperparameters)
    }

    fn load_state_dict(&mut self, state_dict: SchedulerStateDict) -> Result<()> {
        self.position.load("step", &state_dict)?;
        if let Some(&decay_factor) = state_dict.hyperparameters.get("decay_factor") {
            self.decay_factor = decay_factor;
        }
        if let Some(&step_size) = state_dict.hyperparameters.get("step_size") {
            self.step_size = (step_size as usize).max(1);
        }
        if let Some(&warmup_steps) = state_dict.hyperparameters.get("warmup_steps") {
            self.position.warmup_steps = warmup_steps as usize;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.position.reset();
    }
}

/// Constant learning rate
pub struct ConstantScheduler {
    position: Position,
}

impl ConstantScheduler {
    /// Create a new constant scheduler
    pub fn new(base_lr: f64) -> Self {
        Self {
            position: Position::new(base_lr, 0),
        }
    }
}

impl Scheduler for ConstantScheduler {
    fn name(&self) -> &str {
        "constant"
    }

    fn step(&mut self) {
        self.position.current_step += 1;
    }

    fn get_lr(&self) -> f64 {
        self.position.current_lr
    }

    fn step_count(&self) -> usize {
        self.position.current_step
    }

    fn state_dict(&self) -> SchedulerStateDict {
        self.position.state_dict("constant", BTreeMap::new())
    }

    fn load_state_dict(&mut self, state_dict: SchedulerStateDict) -> Result<()> {
        self.position.load("constant", &state_dict)
    }

    fn reset(&mut self) {
        self.position.reset();
    }
}

/// Build a scheduler from its configuration
pub fn create_scheduler(config: &SchedulerConfig, base_lr: f64) -> Result<Box<dyn Scheduler>> {
    config.validate()?;
    let scheduler: Box<dyn Scheduler> = match config.scheduler_type {
        SchedulerType::Constant => Box::new(ConstantScheduler::new(base_lr)),
        SchedulerType::Linear => Box::new(LinearScheduler::new(
            base_lr,
            config.min_lr,
            config.total_steps,
            config.warmup_steps,
        )),
        SchedulerType::Cosine => Box::new(CosineScheduler::new(
            base_lr,
            config.min_lr,
            config.total_steps,
            config.warmup_steps,
        )),
        SchedulerType::Exponential => Box::new(ExponentialScheduler::new(
            base_lr,
            config.decay_factor,
            config.warmup_steps,
        )),
        SchedulerType::Step => Box::new(StepScheduler::new(
            base_lr,
            config.step_size,
            config.decay_factor,
            config.warmup_steps,
        )),
    };
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use test_case::test_case;

    #[test]
    fn test_linear_scheduler() {
        let mut scheduler = LinearScheduler::new(0.001, 0.0, 1000, 100);
        assert_eq!(scheduler.name(), "linear");
        assert_eq!(scheduler.get_lr(), 0.0);

        for _ in 0..50 {
            scheduler.step();
        }
        assert_relative_eq!(scheduler.get_lr(), 0.0005);

        for _ in 50..1000 {
            scheduler.step();
        }
        assert!(scheduler.is_done());
        assert_relative_eq!(scheduler.get_lr(), 0.0);
    }

    #[test]
    fn test_cosine_scheduler_reaches_min() {
        let mut scheduler = CosineScheduler::new(0.01, 0.001, 100, 0);
        assert_eq!(scheduler.get_lr(), 0.01);
        for _ in 0..100 {
            scheduler.step();
        }
        assert!(scheduler.is_done());
        assert_relative_eq!(scheduler.get_lr(), 0.001, epsilon = 1e-12);
    }

    #[test]
    fn test_step_scheduler() {
        let mut scheduler = StepScheduler::new(1.0, 2, 0.5, 0);
        let lrs: Vec<f64> = (0..5)
            .map(|_| {
                scheduler.step();
                scheduler.get_lr()
            })
            .collect();
        assert_eq!(lrs, vec![1.0, 0.5, 0.5, 0.25, 0.25]);
    }

    #[test]
    fn test_constant_scheduler() {
        let mut scheduler = ConstantScheduler::new(0.001);
        for _ in 0..1000 {
            scheduler.step();
        }
        assert_eq!(scheduler.get_lr(), 0.001);
        assert_eq!(scheduler.step_count(), 1000);
    }

    #[test_case(SchedulerType::Linear ; "linear")]
    #[test_case(SchedulerType::Cosine ; "cosine")]
    #[test_case(SchedulerType::Exponential ; "exponential")]
    #[test_case(SchedulerType::Step ; "step")]
    #[test_case(SchedulerType::Constant ; "constant")]
    fn test_restored_scheduler_continues_trajectory(scheduler_type: SchedulerType) {
        let config = SchedulerConfig {
            scheduler_type,
            total_steps: 40,
            warmup_steps: 4,
            step_size: 3,
            decay_factor: 0.9,
            min_lr: 0.0001,
        };
        let mut reference = create_scheduler(&config, 0.1).unwrap();
        for _ in 0..15 {
            reference.step();
        }

        let mut resumed = create_scheduler(&config, 0.1).unwrap();
        resumed.load_state_dict(reference.state_dict()).unwrap();
        for _ in 0..10 {
            reference.step();
            resumed.step();
            assert_eq!(reference.get_lr(), resumed.get_lr());
        }
    }

    #[test]
    fn test_mismatched_state_rejected() {
        let linear = LinearScheduler::new(0.1, 0.0, 10, 0);
        let mut cosine = CosineScheduler::new(0.1, 0.0, 10, 0);
        assert!(cosine.load_state_dict(linear.state_dict()).is_err());
    }

    #[test]
    fn test_reset() {
        let mut scheduler = ExponentialScheduler::new(1.0, 0.5, 0);
        scheduler.step();
        scheduler.step();
        assert_relative_eq!(scheduler.get_lr(), 0.25);
        scheduler.reset();
        assert_eq!(scheduler.step_count(), 0);
        assert_eq!(scheduler.get_lr(), 1.0);
    }
}
