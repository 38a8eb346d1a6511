//! Optimizers and learning rate schedulers
//!
//! The loop driver treats optimizers as opaque: it zeroes them, hands them
//! the gradients of the step and later asks for their state when a
//! checkpoint is written. Schedulers are advanced by the LR scheduler hook.

pub mod schedulers;
pub mod sgd;

pub use schedulers::{
    create_scheduler, ConstantScheduler, CosineScheduler, ExponentialScheduler, LinearScheduler,
    StepScheduler,
};
pub use sgd::SgdOptimizer;

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::training::config::OptimizerConfig;
use crate::training::model::VarMapModel;

/// Trait for optimizers
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Clear any accumulated gradient state before the next backward pass
    fn zero_grad(&mut self) -> Result<()>;

    /// Apply one update from the gradients of the current step
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of updates applied so far
    fn step_count(&self) -> usize;

    /// Get optimizer state for checkpointing
    fn state_dict(&self) -> Result<OptimizerStateDict>;

    /// Load optimizer state from checkpoint
    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()>;
}

/// Optimizer state dictionary for checkpointing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStateDict {
    /// Optimizer type
    pub optimizer_type: String,

    /// Current step count
    pub step_count: usize,

    /// Current learning rate
    pub learning_rate: f64,

    /// Per-parameter buffers, keyed by parameter name
    pub state: BTreeMap<String, OptimizerTensorState>,

    /// Hyperparameters
    pub hyperparameters: BTreeMap<String, f64>,
}

/// Flattened tensor buffer (momentum, moving averages)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerTensorState {
    /// Tensor shape
    pub shape: Vec<usize>,

    /// Tensor data (flattened)
    pub data: Vec<f32>,
}

impl OptimizerTensorState {
    /// Capture a tensor
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: tensor
                .to_dtype(candle_core::DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?,
        })
    }

    /// Rebuild the tensor on `device`
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

impl OptimizerStateDict {
    /// Encode for a checkpoint blob
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a checkpoint blob
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Build an optimizer over the parameters of `model`
pub fn create_optimizer(config: &OptimizerConfig, model: &VarMapModel) -> Result<Box<dyn Optimizer>> {
    config.validate()?;
    Ok(Box::new(SgdOptimizer::new(
        model.var_map(),
        config.learning_rate,
        config.momentum,
        config.weight_decay,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_state_roundtrip() {
        let tensor = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let state = OptimizerTensorState::from_tensor(&tensor).unwrap();
        assert_eq!(state.shape, vec![2, 2]);
        let rebuilt = state.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(rebuilt.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn test_state_dict_bytes() {
        let mut state = OptimizerStateDict {
            optimizer_type: "sgd".to_string(),
            step_count: 3,
            learning_rate: 0.1,
            state: BTreeMap::new(),
            hyperparameters: BTreeMap::new(),
        };
        state.hyperparameters.insert("momentum".to_string(), 0.9);
        let decoded = OptimizerStateDict::from_bytes(&state.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_truncated_bytes_rejected() {
        let state = OptimizerStateDict {
            optimizer_type: "sgd".to_string(),
            step_count: 1,
            learning_rate: 0.1,
            state: BTreeMap::new(),
            hyperparameters: BTreeMap::new(),
        };
        let bytes = state.to_bytes().unwrap();
        assert!(OptimizerStateDict::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}
