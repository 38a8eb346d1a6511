//! Model collaborators

use std::path::Path;

use anyhow::{Context as _, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use safetensors::{Dtype, SafeTensors};

/// A trainable model as seen by the loop driver
pub trait Model: Send {
    /// Model name, used in logs
    fn name(&self) -> &str;

    /// Switch between training and evaluation behaviour
    fn set_training(&mut self, training: bool);

    /// Whether the model is in training mode
    fn is_training(&self) -> bool;

    /// Write all parameters to `path`
    fn save(&self, path: &Path) -> Result<()>;

    /// Read all parameters from `path`
    fn load(&mut self, path: &Path) -> Result<()>;

    /// Check that `path` holds a loadable parameter blob without touching
    /// the live parameters
    fn verify(&self, path: &Path) -> Result<()> {
        anyhow::ensure!(path.is_file(), "missing parameter file {}", path.display());
        Ok(())
    }

    /// Named parameter tensors, for summaries. Models that do not expose
    /// their variables return nothing
    fn parameters(&self) -> Result<Vec<(String, Tensor)>> {
        Ok(Vec::new())
    }
}

/// Storage dtype that a candle dtype is written as
fn storage_dtype(dtype: DType) -> Option<Dtype> {
    match dtype {
        DType::U8 => Some(Dtype::U8),
        DType::U32 => Some(Dtype::U32),
        DType::I64 => Some(Dtype::I64),
        DType::BF16 => Some(Dtype::BF16),
        DType::F16 => Some(Dtype::F16),
        DType::F32 => Some(Dtype::F32),
        DType::F64 => Some(Dtype::F64),
        _ => None,
    }
}

/// Model backed by a candle [`VarMap`], stored as safetensors
pub struct VarMapModel {
    name: String,
    var_map: VarMap,
    device: Device,
    training: bool,
}

impl VarMapModel {
    /// Wrap an existing variable map
    pub fn new(name: impl Into<String>, var_map: VarMap, device: Device) -> Self {
        Self {
            name: name.into(),
            var_map,
            device,
            training: false,
        }
    }

    /// Shared handle to the variables; clones see parameter updates
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Builder that creates variables inside this model
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.var_map, DType::F32, &self.device)
    }

    /// Number of scalar parameters
    pub fn parameter_count(&self) -> usize {
        self.var_map
            .all_vars()
            .iter()
            .map(|var| var.as_tensor().elem_count())
            .sum()
    }
}

impl Model for VarMapModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.var_map
            .save(path)
            .with_context(|| format!("Failed to save model '{}' to {}", self.name, path.display()))
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        self.var_map
            .load(path)
            .with_context(|| format!("Failed to load model '{}' from {}", self.name, path.display()))
    }

    fn verify(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|e| anyhow::anyhow!("Invalid safetensors file {}: {e}", path.display()))?;
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Variable map lock poisoned"))?;
        for (name, var) in data.iter() {
            let stored = tensors
                .tensor(name)
                .map_err(|_| anyhow::anyhow!("parameter '{name}' missing from {}", path.display()))?;
            anyhow::ensure!(
                stored.shape() == var.dims(),
                "parameter '{name}' has shape {:?} in {}, expected {:?}",
                stored.shape(),
                path.display(),
                var.dims()
            );
            if let Some(expected) = storage_dtype(var.dtype()) {
                anyhow::ensure!(
                    stored.dtype() == expected,
                    "parameter '{name}' stored as {:?} in {}, expected {expected:?}",
                    stored.dtype(),
                    path.display()
                );
            }
        }
        Ok(())
    }

    fn parameters(&self) -> Result<Vec<(String, Tensor)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Variable map lock poisoned"))?;
        let mut parameters: Vec<(String, Tensor)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        parameters.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(parameters)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::TempDir;

    fn linear_model() -> VarMapModel {
        let model = VarMapModel::new("linear", VarMap::new(), Device::Cpu);
        candle_nn::linear(1, 1, model.var_builder().pp("fc")).unwrap();
        model
    }

    #[test]
    fn test_parameter_count() {
        let model = linear_model();
        assert_eq!(model.parameter_count(), 2);
        assert!(!model.is_training());
    }

    #[test]
    fn test_save_load_restores_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.safetensors");

        let mut model = linear_model();
        let before: Vec<Vec<f32>> = model
            .var_map()
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        model.save(&path).unwrap();
        model.verify(&path).unwrap();

        for var in model.var_map().all_vars() {
            var.set(&Tensor::zeros_like(var.as_tensor()).unwrap()).unwrap();
        }
        model.load(&path).unwrap();

        let after: Vec<Vec<f32>> = model
            .var_map()
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.safetensors");
        std::fs::write(&path, b"not a tensor file").unwrap();

        let model = linear_model();
        assert!(model.verify(&path).is_err());
        assert!(model.verify(&temp.path().join("absent.safetensors")).is_err());
    }

    #[test]
    fn test_verify_rejects_shape_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.safetensors");
        let model = linear_model();

        // right names, wrong shapes
        let tensors: HashMap<String, Tensor> = model
            .parameters()
            .unwrap()
            .into_iter()
            .map(|(name, _)| (name, Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap()))
            .collect();
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let err = model.verify(&path).unwrap_err();
        assert!(err.to_string().contains("shape"), "{err}");
    }

    #[test]
    fn test_verify_rejects_dtype_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.safetensors");
        let model = linear_model();

        let tensors: HashMap<String, Tensor> = model
            .parameters()
            .unwrap()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.to_dtype(DType::F64).unwrap()))
            .collect();
        candle_core::safetensors::save(&tensors, &path).unwrap();

        assert!(model.verify(&path).is_err());
    }

    #[test]
    fn test_parameters_are_sorted_by_name() {
        let model = linear_model();
        let names: Vec<String> = model.parameters().unwrap().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["fc.bias".to_string(), "fc.weight".to_string()]);
    }
}
