//! SGD optimizer implementation with momentum
//!
//! Stochastic Gradient Descent with optional momentum and weight decay,
//! applied directly to the variables of a candle [`VarMap`].

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use super::{Optimizer, OptimizerStateDict, OptimizerTensorState};

/// SGD optimizer with momentum
pub struct SgdOptimizer {
    /// Variable map containing parameters
    var_map: VarMap,

    /// Learning rate
    learning_rate: f64,

    /// Momentum coefficient
    momentum: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// Momentum buffers
    momentum_buffers: HashMap<String, Tensor>,
}

impl SgdOptimizer {
    /// Create a new SGD optimizer
    pub fn new(var_map: &VarMap, learning_rate: f64, momentum: f64, weight_decay: f64) -> Result<Self> {
        anyhow::ensure!(learning_rate >= 0.0, "learning rate must be >= 0, got {learning_rate}");
        anyhow::ensure!((0.0..1.0).contains(&momentum), "momentum must be in [0, 1), got {momentum}");

        Ok(Self {
            var_map: var_map.clone(),
            learning_rate,
            momentum,
            weight_decay,
            step_count: 0,
            momentum_buffers: HashMap::new(),
        })
    }

    /// Parameters sorted by name so updates are applied in a stable order
    fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Variable map lock poisoned"))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Apply SGD update to a parameter
    fn update_parameter(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let effective_grad = if self.weight_decay > 0.0 {
            (grad + (param.as_tensor() * self.weight_decay)?)?
        } else {
            grad.clone()
        };

        let update = if self.momentum > 0.0 {
            // v_t = μ * v_{t-1} + g_t
            let velocity = match self.momentum_buffers.get(name) {
                Some(buffer) => ((buffer * self.momentum)? + &effective_grad)?,
                None => effective_grad,
            };
            self.momentum_buffers.insert(name.to_string(), velocity.clone());
            velocity
        } else {
            effective_grad
        };

        // θ_t = θ_{t-1} - α * update
        let updated = (param.as_tensor() - (update * self.learning_rate)?)?;
        param.set(&updated)?;
        Ok(())
    }
}

impl Optimizer for SgdOptimizer {
    fn name(&self) -> &str {
        if self.momentum > 0.0 {
            "sgd_momentum"
        } else {
            "sgd"
        }
    }

    fn zero_grad(&mut self) -> Result<()> {
        // candle hands out fresh gradients on every backward pass
        Ok(())
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;
        for (name, var) in self.named_vars()? {
            if let Some(grad) = gradients.get(var.as_tensor()) {
                let grad = grad.clone();
                self.update_parameter(&name, &var, &grad)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state_dict(&self) -> Result<OptimizerStateDict> {
        let mut state = BTreeMap::new();
        for (name, tensor) in &self.momentum_buffers {
            state.insert(name.clone(), OptimizerTensorState::from_tensor(tensor)?);
        }

        let mut hyperparameters = BTreeMap::new();
        hyperparameters.insert("momentum".to_string(), self.momentum);
        hyperparameters.insert("weight_decay".to_string(), self.weight_decay);

        Ok(OptimizerStateDict {
            optimizer_type: self.name().to_string(),
            step_count: self.step_count,
            learning_rate: self.learning_rate,
            state,
            hyperparameters,
        })
    }

    fn load_state_dict(&mut self, state_dict: OptimizerStateDict) -> Result<()> {
        let mut buffers = HashMap::new();
        for (name, var) in self.named_vars()? {
            if let Some(buffer) = state_dict.state.get(&name) {
                buffers.insert(name, buffer.to_tensor(var.as_tensor().device())?);
            }
        }

        self.step_count = state_dict.step_count;
        self.learning_rate = state_dict.learning_rate;
        if let Some(&momentum) = state_dict.hyperparameters.get("momentum") {
            self.momentum = momentum;
        }
        if let Some(&weight_decay) = state_dict.hyperparameters.get("weight_decay") {
            self.weight_decay = weight_decay;
        }
        self.momentum_buffers = buffers;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn scalar_param(var_map: &VarMap, value: f64) -> Tensor {
        let vb = VarBuilder::from_varmap(var_map, DType::F32, &Device::Cpu);
        vb.get_with_hints((), "w", Init::Const(value)).unwrap()
    }

    fn read(var_map: &VarMap) -> f32 {
        var_map.all_vars()[0].as_tensor().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_sgd_optimizer_creation() {
        let var_map = VarMap::new();
        let opt = SgdOptimizer::new(&var_map, 0.01, 0.9, 0.0001).unwrap();
        assert_eq!(opt.name(), "sgd_momentum");
        assert_eq!(opt.learning_rate(), 0.01);
        assert_eq!(opt.step_count(), 0);

        let plain = SgdOptimizer::new(&var_map, 0.01, 0.0, 0.0).unwrap();
        assert_eq!(plain.name(), "sgd");
        assert!(SgdOptimizer::new(&var_map, 0.01, 1.5, 0.0).is_err());
    }

    #[test]
    fn test_plain_step_descends() {
        let var_map = VarMap::new();
        let w = scalar_param(&var_map, 1.0);
        let mut opt = SgdOptimizer::new(&var_map, 0.1, 0.0, 0.0).unwrap();

        // d(w^2)/dw = 2w = 2
        let grads = w.sqr().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();
        assert_relative_eq!(read(&var_map), 0.8, epsilon = 1e-6);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_momentum_state_roundtrip() {
        let var_map = VarMap::new();
        let w = scalar_param(&var_map, 1.0);
        let mut opt = SgdOptimizer::new(&var_map, 0.1, 0.9, 0.0).unwrap();
        let grads = w.sqr().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();

        let state = opt.state_dict().unwrap();
        assert_eq!(state.state.len(), 1);
        assert_eq!(state.state["w"].data, vec![2.0]);

        let mut restored = SgdOptimizer::new(&var_map, 0.5, 0.0, 0.0).unwrap();
        restored.load_state_dict(state.clone()).unwrap();
        assert_eq!(restored.state_dict().unwrap(), state);
        assert_eq!(restored.name(), "sgd_momentum");
    }
}
