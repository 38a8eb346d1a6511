//! Shared loop state read and written by the trainer and every hook

use candle_core::Tensor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mutable loop-state bag shared between the trainer and its hooks.
///
/// The core fields are owned by the trainer. Hooks that need to stash their
/// own values use the `extras` map, which is persisted along with the core
/// fields when a checkpoint is written. The current `batch` holds live
/// tensors and is never serialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    /// Current epoch (0-indexed)
    pub epoch: usize,

    /// Total number of epochs this run is configured for
    pub num_epochs: usize,

    /// Step index across all epochs
    pub global_step: usize,

    /// Step index within the current epoch
    pub batch_index: usize,

    /// Steps in the current epoch, the max over all data sources
    pub iterator_length: usize,

    /// Loss of the most recent step
    pub step_loss: Option<f64>,

    /// One batch per data source; `None` marks an exhausted source
    #[serde(skip)]
    pub batch: Vec<Option<Tensor>>,

    /// Hook-private values
    #[serde(default)]
    pub extras: Map<String, Value>,
}

impl Context {
    /// Create a fresh context
    pub fn new(num_epochs: usize) -> Self {
        Self {
            num_epochs,
            ..Self::default()
        }
    }

    /// Reset to the start-of-training state, keeping the epoch budget
    pub fn reset(&mut self) {
        let num_epochs = self.num_epochs;
        *self = Self::new(num_epochs);
    }

    /// Recompute `global_step` from the epoch and in-epoch position
    pub fn update_global_step(&mut self) {
        self.global_step = self.epoch * self.iterator_length + self.batch_index;
    }

    /// Batch of the data source at `index`, if that source still had one
    pub fn batch_at(&self, index: usize) -> Option<&Tensor> {
        self.batch.get(index).and_then(Option::as_ref)
    }

    /// Store a hook-private value
    pub fn insert_extra<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> anyhow::Result<()> {
        self.extras.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read a hook-private value, `None` when absent or of another shape
    pub fn extra<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.extras
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Remove a hook-private value
    pub fn remove_extra(&mut self, key: &str) -> Option<Value> {
        self.extras.remove(key)
    }

    /// Serialize the persistent part of the context
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Restore a context written by [`Context::to_json`]
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch
            && self.num_epochs == other.num_epochs
            && self.global_step == other.global_step
            && self.batch_index == other.batch_index
            && self.iterator_length == other.iterator_length
            && self.step_loss == other.step_loss
            && self.extras == other.extras
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_global_step() {
        let mut ctx = Context::new(2);
        ctx.epoch = 1;
        ctx.iterator_length = 10;
        ctx.batch_index = 4;
        ctx.update_global_step();
        assert_eq!(ctx.global_step, 14);
    }

    #[test]
    fn test_reset_keeps_epoch_budget() {
        let mut ctx = Context::new(3);
        ctx.epoch = 2;
        ctx.global_step = 40;
        ctx.step_loss = Some(0.5);
        ctx.insert_extra("seen", &7usize).unwrap();
        ctx.reset();
        assert_eq!(ctx, Context::new(3));
    }

    #[test]
    fn test_json_roundtrip_skips_batch() {
        let mut ctx = Context::new(2);
        ctx.global_step = 12;
        ctx.step_loss = Some(1.25);
        ctx.batch = vec![Some(Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap()), None];
        ctx.insert_extra("lr_trace", &vec![0.1f64, 0.05]).unwrap();

        let restored = Context::from_json(&ctx.to_json().unwrap()).unwrap();
        assert!(restored.batch.is_empty());
        assert_eq!(restored, ctx);
        assert_eq!(restored.extra::<Vec<f64>>("lr_trace"), Some(vec![0.1, 0.05]));
    }

    #[test]
    fn test_extras_access() {
        let mut ctx = Context::default();
        assert_eq!(ctx.extra::<usize>("missing"), None);
        ctx.insert_extra("count", &3usize).unwrap();
        assert_eq!(ctx.extra::<String>("count"), None);
        assert_eq!(ctx.extra::<usize>("count"), Some(3));
        assert!(ctx.remove_extra("count").is_some());
        assert!(ctx.extras.is_empty());
    }

    #[test]
    fn test_batch_at_sentinel() {
        let mut ctx = Context::default();
        ctx.batch = vec![None, Some(Tensor::new(3f32, &Device::Cpu).unwrap())];
        assert!(ctx.batch_at(0).is_none());
        assert!(ctx.batch_at(1).is_some());
        assert!(ctx.batch_at(2).is_none());
    }
}
