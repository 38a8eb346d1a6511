//! Deterministic, resumable data loader

use std::sync::Arc;

use anyhow::Result;
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use super::{DataSource, Dataset};
use crate::training::config::DataLoaderConfig;

/// Batches samples of a [`Dataset`] in a seeded per-epoch order.
///
/// The order of epoch `e` depends only on `(seed, e)`, so skipping the first
/// `n` batches after a restart yields exactly the batches an uninterrupted
/// run would still have produced.
pub struct DataLoader<D: Dataset> {
    dataset: Arc<D>,
    config: DataLoaderConfig,
    rank: usize,
    world_size: usize,
    /// Sample indices of each batch of the current epoch, for this shard
    batches: Vec<Vec<usize>>,
    cursor: usize,
    pending_skip: usize,
}

impl<D: Dataset> DataLoader<D> {
    /// Create a new DataLoader
    pub fn new(dataset: Arc<D>, config: DataLoaderConfig) -> Self {
        info!(
            "Creating DataLoader with batch_size={}, shuffle={}, seed={}",
            config.batch_size, config.shuffle, config.seed
        );

        Self {
            dataset,
            config,
            rank: 0,
            world_size: 1,
            batches: Vec::new(),
            cursor: 0,
            pending_skip: 0,
        }
    }

    /// Only yield this worker's share of the batches.
    ///
    /// Batches are dealt round-robin; when they do not divide evenly the
    /// shard wraps around so every worker runs the same number of steps.
    pub fn with_shard(mut self, rank: usize, world_size: usize) -> Self {
        let world_size = world_size.max(1);
        self.rank = rank.min(world_size - 1);
        self.world_size = world_size;
        self
    }

    /// Number of batches over the whole dataset, before sharding
    fn total_batches(&self) -> usize {
        let size = self.dataset.len();
        if self.config.drop_last {
            size / self.config.batch_size
        } else {
            size.div_ceil(self.config.batch_size)
        }
    }

    /// Sample order of `epoch`
    fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        indices
    }

    fn build_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let all: Vec<Vec<usize>> = self
            .epoch_indices(epoch)
            .chunks(self.config.batch_size)
            .take(self.total_batches())
            .map(<[usize]>::to_vec)
            .collect();
        if self.world_size == 1 || all.is_empty() {
            return all;
        }

        (0..self.len())
            .map(|position| all[(position * self.world_size + self.rank) % all.len()].clone())
            .collect()
    }
}

impl<D: Dataset> DataSource for DataLoader<D> {
    fn len(&self) -> usize {
        self.total_batches().div_ceil(self.world_size)
    }

    fn set_epoch(&mut self, epoch: usize) -> Result<()> {
        self.batches = self.build_batches(epoch);
        self.cursor = self.pending_skip.min(self.batches.len());
        self.pending_skip = 0;
        debug!(
            "Prepared epoch {} with {} batches, starting at {}",
            epoch,
            self.batches.len(),
            self.cursor
        );
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Tensor>> {
        let Some(indices) = self.batches.get(self.cursor) else {
            return Ok(None);
        };
        let samples = indices
            .iter()
            .map(|&index| self.dataset.get(index))
            .collect::<Result<Vec<_>>>()?;
        self.cursor += 1;
        Ok(Some(Tensor::stack(&samples, 0)?))
    }

    fn skip_batches(&mut self, n: usize) {
        self.pending_skip = n;
    }

    fn pending_skip(&self) -> usize {
        self.pending_skip
    }

    fn consumed(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::data::RangeDataset;
    use candle_core::Device;

    fn loader(len: usize, batch_size: usize, shuffle: bool) -> DataLoader<RangeDataset> {
        DataLoader::new(
            Arc::new(RangeDataset::new(len, Device::Cpu)),
            DataLoaderConfig {
                batch_size,
                shuffle,
                seed: 7,
                drop_last: false,
            },
        )
    }

    fn drain(loader: &mut impl DataSource) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            out.push(batch.to_vec1::<f32>().unwrap());
        }
        out
    }

    #[test]
    fn test_len_and_partial_batch() {
        let mut data = loader(10, 3, false);
        assert_eq!(data.len(), 4);
        data.set_epoch(0).unwrap();
        let batches = drain(&mut data);
        assert_eq!(batches.last().unwrap(), &vec![9.0]);
        assert_eq!(data.consumed(), 4);

        let mut dropping = DataLoader::new(
            Arc::new(RangeDataset::new(10, Device::Cpu)),
            DataLoaderConfig {
                batch_size: 3,
                shuffle: false,
                seed: 0,
                drop_last: true,
            },
        );
        assert_eq!(dropping.len(), 3);
        dropping.set_epoch(0).unwrap();
        assert_eq!(drain(&mut dropping).len(), 3);
    }

    #[test]
    fn test_epoch_order_is_deterministic() {
        let mut a = loader(20, 2, true);
        let mut b = loader(20, 2, true);
        a.set_epoch(3).unwrap();
        b.set_epoch(3).unwrap();
        assert_eq!(drain(&mut a), drain(&mut b));

        a.set_epoch(0).unwrap();
        b.set_epoch(1).unwrap();
        assert_ne!(drain(&mut a), drain(&mut b));
    }

    #[test]
    fn test_skip_reproduces_suffix() {
        let mut full = loader(10, 1, true);
        full.set_epoch(1).unwrap();
        let reference = drain(&mut full);

        let mut resumed = loader(10, 1, true);
        resumed.skip_batches(4);
        assert_eq!(resumed.pending_skip(), 4);
        resumed.set_epoch(1).unwrap();
        assert_eq!(resumed.consumed(), 4);
        assert_eq!(resumed.pending_skip(), 0);
        assert_eq!(drain(&mut resumed), reference[4..].to_vec());

        // the skip only applies to one epoch
        resumed.set_epoch(2).unwrap();
        assert_eq!(drain(&mut resumed).len(), 10);
    }

    #[test]
    fn test_skip_past_end_yields_nothing() {
        let mut data = loader(5, 1, false);
        data.skip_batches(5);
        data.set_epoch(0).unwrap();
        assert!(data.next_batch().unwrap().is_none());
        assert_eq!(data.consumed(), 5);
    }

    #[test]
    fn test_shards_cover_dataset() {
        let mut seen = Vec::new();
        for rank in 0..2 {
            let mut shard = loader(10, 1, true).with_shard(rank, 2);
            assert_eq!(shard.len(), 5);
            shard.set_epoch(0).unwrap();
            seen.extend(drain(&mut shard).into_iter().flatten());
        }
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, (0..10).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_uneven_shards_wrap() {
        let mut shard = loader(5, 1, false).with_shard(1, 2);
        assert_eq!(shard.len(), 3);
        shard.set_epoch(0).unwrap();
        assert_eq!(drain(&mut shard), vec![vec![1.0], vec![3.0], vec![0.0]]);
    }
}
