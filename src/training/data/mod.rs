//! Data loading infrastructure
//!
//! The trainer consumes [`DataSource`]s. A source has a fixed length per
//! epoch, an iteration order that is a pure function of its seed and the
//! epoch number, and can be told to skip batches it already produced before
//! an interruption.

use anyhow::Result;
use candle_core::Tensor;

pub mod datasets;
pub mod loaders;

pub use datasets::{InMemoryDataset, RangeDataset};
pub use loaders::DataLoader;

/// Common trait for all training datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a sample by index
    fn get(&self, index: usize) -> Result<Tensor>;
}

/// Batch producer driven by the trainer
pub trait DataSource: Send {
    /// Number of batches per epoch
    fn len(&self) -> usize;

    /// Whether an epoch yields no batches
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prepare the iteration order of `epoch` and apply any pending skip
    fn set_epoch(&mut self, epoch: usize) -> Result<()>;

    /// Next batch of the current epoch, `None` once exhausted
    fn next_batch(&mut self) -> Result<Option<Tensor>>;

    /// Skip the first `n` batches of the next epoch started with `set_epoch`
    fn skip_batches(&mut self, n: usize);

    /// Batches that the next `set_epoch` will skip
    fn pending_skip(&self) -> usize;

    /// Batches consumed in the current epoch, skipped ones included
    fn consumed(&self) -> usize;
}
