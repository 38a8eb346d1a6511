//! Simple in-memory datasets

use anyhow::Result;
use candle_core::{Device, Tensor};

use super::Dataset;

/// Dataset whose samples are the integers `0..len`, as f32 scalars
#[derive(Debug, Clone)]
pub struct RangeDataset {
    len: usize,
    device: Device,
}

impl RangeDataset {
    /// Create a new range dataset
    pub fn new(len: usize, device: Device) -> Self {
        Self { len, device }
    }
}

impl Dataset for RangeDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<Tensor> {
        anyhow::ensure!(index < self.len, "Invalid sample index: {index} >= {}", self.len);
        Ok(Tensor::new(index as f32, &self.device)?)
    }
}

/// Dataset over pre-built sample tensors
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    samples: Vec<Tensor>,
}

impl InMemoryDataset {
    /// Create a dataset from samples of identical shape
    pub fn new(samples: Vec<Tensor>) -> Result<Self> {
        if let Some(first) = samples.first() {
            let shape = first.shape();
            anyhow::ensure!(
                samples.iter().all(|sample| sample.shape() == shape),
                "all samples must share the shape {shape:?}"
            );
        }
        Ok(Self { samples })
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Tensor> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Invalid sample index: {index} >= {}", self.samples.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_dataset() {
        let dataset = RangeDataset::new(3, Device::Cpu);
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.get(2).unwrap().to_scalar::<f32>().unwrap(), 2.0);
        assert!(dataset.get(3).is_err());
    }

    #[test]
    fn test_in_memory_dataset_shapes() {
        let a = Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let b = Tensor::new(&[3f32, 4.0], &Device::Cpu).unwrap();
        let c = Tensor::new(&[5f32], &Device::Cpu).unwrap();
        assert!(InMemoryDataset::new(vec![a.clone(), b.clone()]).is_ok());
        assert!(InMemoryDataset::new(vec![a, c]).is_err());
        assert!(InMemoryDataset::new(Vec::new()).unwrap().is_empty());
    }
}
