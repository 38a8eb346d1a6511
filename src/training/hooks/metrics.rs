//! Scalar metric recording
//!
//! Metrics are appended as JSON lines to `<folder>/metrics.jsonl`. The file
//! is owned by a [`MessageRelay`] so writes never block the training loop.
//!
//! With `record_parameters`, every epoch end also records the norm and mean
//! of each model variable and the norm of its latest gradient, tagged
//! `Parameters/<model>-<variable>/{norm,mean}` and
//! `Gradients/<model>-<variable>/norm`.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use candle_core::{DType, Tensor};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Hook;
use crate::error::Error;
use crate::training::config::MetricConfig;
use crate::training::relay::{MessageRelay, RelayTarget};
use crate::training::trainer::Trainer;
use crate::utils::io;

/// File the records are appended to inside the metric folder
pub const METRICS_FILE: &str = "metrics.jsonl";

/// One recorded scalar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub tag: String,
    pub step: usize,
    pub value: f64,
    /// Seconds since the Unix epoch
    pub wall_time: f64,
}

impl MetricRecord {
    pub fn new(tag: impl Into<String>, step: usize, value: f64) -> Self {
        Self {
            tag: tag.into(),
            step,
            value,
            wall_time: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Work items for the metric writer
#[derive(Debug, Clone, PartialEq)]
pub enum MetricMessage {
    /// Append a record
    Record(MetricRecord),
    /// Drop every record with `step >= from_step`
    Purge { from_step: usize },
    /// Flush buffered records to disk
    Flush,
}

/// Read every record of a metrics file
pub fn read_records(path: &Path) -> Result<Vec<MetricRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    reader
        .lines()
        .filter(|line| line.as_ref().map_or(true, |line| !line.trim().is_empty()))
        .map(|line| -> Result<MetricRecord> { Ok(serde_json::from_str(&line?)?) })
        .collect()
}

/// L2 norm and mean of a tensor
fn summarize(tensor: &Tensor) -> Result<(f64, f64)> {
    let tensor = tensor.to_dtype(DType::F64)?;
    let norm = tensor.sqr()?.sum_all()?.sqrt()?.to_scalar::<f64>()?;
    let mean = tensor.mean_all()?.to_scalar::<f64>()?;
    Ok((norm, mean))
}

/// Owner of the metrics file, run on the relay thread
struct MetricWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl MetricWriter {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("Failed to open {}", self.path.display()))?;
            self.file = Some(BufWriter::new(file));
        }
        self.file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("metrics file not open"))
    }

    fn purge(&mut self, from_step: usize) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        let records = read_records(&self.path)?;
        let total = records.len();
        let mut content = Vec::new();
        let mut kept = 0;
        for record in records.iter().filter(|record| record.step < from_step) {
            serde_json::to_writer(&mut content, record)?;
            content.push(b'\n');
            kept += 1;
        }
        io::write_file_atomic(&self.path, &content)?;
        debug!("Purged {} metric records from step {}", total - kept, from_step);
        Ok(())
    }
}

impl RelayTarget for MetricWriter {
    type Message = MetricMessage;

    fn name(&self) -> &str {
        "metrics"
    }

    fn handle(&mut self, message: MetricMessage) -> Result<()> {
        match message {
            MetricMessage::Record(record) => {
                let writer = self.writer()?;
                serde_json::to_writer(&mut *writer, &record)?;
                writer.write_all(b"\n")?;
            }
            MetricMessage::Purge { from_step } => self.purge(from_step)?,
            MetricMessage::Flush => {
                if let Some(file) = self.file.as_mut() {
                    file.flush()?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for MetricWriter {
    fn drop(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}

/// Records the training loss and learning rates on the coordinating worker
#[derive(Debug)]
pub struct MetricHook {
    config: MetricConfig,
    relay: Option<MessageRelay<MetricWriter>>,
    /// Steps run in the current epoch since training started
    epoch_steps: usize,
}

impl MetricHook {
    pub fn new(config: MetricConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            relay: None,
            epoch_steps: 0,
        })
    }

    /// Path of the metrics file
    pub fn metrics_path(&self) -> PathBuf {
        self.config.folder_path.join(METRICS_FILE)
    }

    /// Enqueue a record; a no-op off the coordinating worker
    pub fn record(&self, tag: impl Into<String>, step: usize, value: f64) {
        if let Some(relay) = &self.relay {
            relay.send(MetricMessage::Record(MetricRecord::new(tag, step, value)));
        }
    }

    fn start(&mut self, trainer: &Trainer) -> Result<()> {
        if self.relay.is_some() || !trainer.accelerator().is_main_process() {
            return Ok(());
        }
        io::ensure_dir_exists(&self.config.folder_path)?;
        self.relay = Some(MessageRelay::spawn(MetricWriter::new(self.metrics_path())));
        info!("Recording metrics to {}", self.metrics_path().display());
        Ok(())
    }

    fn record_parameters(&self, trainer: &Trainer) -> Result<()> {
        let step = trainer.ctx().global_step;
        let gradients = trainer.last_gradients();
        for model in trainer.models() {
            for (name, tensor) in model.parameters()? {
                let (norm, mean) = summarize(&tensor)?;
                self.record(format!("Parameters/{}-{name}/norm", model.name()), step, norm);
                self.record(format!("Parameters/{}-{name}/mean", model.name()), step, mean);
                if let Some(grad) = gradients.and_then(|grads| grads.get(&tensor)) {
                    let (norm, _) = summarize(grad)?;
                    self.record(format!("Gradients/{}-{name}/norm", model.name()), step, norm);
                }
            }
        }
        Ok(())
    }

    /// Block until every enqueued record is on disk
    pub fn flush(&self) {
        if let Some(relay) = &self.relay {
            relay.send(MetricMessage::Flush);
            relay.flush();
        }
    }
}

impl Hook for MetricHook {
    fn name(&self) -> &str {
        "MetricHook"
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn on_training_start(&mut self, trainer: &mut Trainer) -> Result<()> {
        if self.config.record_parameters {
            trainer.set_retain_gradients(true);
        }
        self.start(trainer)
    }

    fn on_epoch_start(&mut self, _trainer: &mut Trainer) -> Result<()> {
        self.epoch_steps = 0;
        Ok(())
    }

    fn on_checkpoint_restored(&mut self, trainer: &mut Trainer) -> Result<()> {
        // may run before our own on_training_start
        self.start(trainer)?;
        // steps after the checkpoint are run again
        if let Some(relay) = &self.relay {
            relay.send(MetricMessage::Purge {
                from_step: trainer.ctx().global_step + 1,
            });
        }
        Ok(())
    }

    fn on_step_end(&mut self, trainer: &mut Trainer) -> Result<()> {
        self.epoch_steps += 1;
        if self.relay.is_none() {
            return Ok(());
        }
        let ctx = trainer.ctx();
        if (ctx.global_step + 1) % self.config.interval != 0 {
            return Ok(());
        }
        if let Some(loss) = ctx.step_loss {
            self.record("Loss/Training", ctx.global_step, loss);
        }
        for (index, optimizer) in trainer.optimizers().iter().enumerate() {
            self.record(format!("LearningRate/{index}"), ctx.global_step, optimizer.learning_rate());
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, trainer: &mut Trainer) -> Result<()> {
        // an epoch end re-entered right after a restore was recorded by the
        // interrupted run
        if self.relay.is_none() || !self.config.record_parameters || self.epoch_steps == 0 {
            return Ok(());
        }
        self.record_parameters(trainer)
    }

    fn on_training_end(&mut self, _trainer: &mut Trainer) -> Result<()> {
        self.flush();
        self.relay = None;
        Ok(())
    }

    fn on_fatal_error(&mut self, _trainer: &mut Trainer, _error: &Error) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_appends_and_purges() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(METRICS_FILE);
        let relay = MessageRelay::spawn(MetricWriter::new(path.clone()));

        for step in 0..10 {
            relay.send(MetricMessage::Record(MetricRecord::new("Loss/Training", step, step as f64)));
        }
        relay.send(MetricMessage::Flush);
        relay.flush();
        assert_eq!(read_records(&path).unwrap().len(), 10);

        relay.send(MetricMessage::Purge { from_step: 6 });
        relay.send(MetricMessage::Record(MetricRecord::new("Loss/Training", 6, 0.5)));
        relay.send(MetricMessage::Flush);
        relay.flush();

        let records = read_records(&path).unwrap();
        let steps: Vec<usize> = records.iter().map(|record| record.step).collect();
        assert_eq!(steps, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(records[6].value, 0.5);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_records(&temp.path().join(METRICS_FILE)).unwrap().is_empty());
    }

    #[test]
    fn test_hook_without_relay_is_noop() {
        let temp = TempDir::new().unwrap();
        let hook = MetricHook::new(MetricConfig {
            folder_path: temp.path().to_path_buf(),
            interval: 1,
            record_parameters: true,
        })
        .unwrap();
        hook.record("Loss/Training", 0, 1.0);
        hook.flush();
        assert!(!hook.metrics_path().exists());
    }

    #[test]
    fn test_summarize() {
        let tensor = Tensor::new(&[3.0f32, -4.0], &candle_core::Device::Cpu).unwrap();
        let (norm, mean) = summarize(&tensor).unwrap();
        assert!((norm - 5.0).abs() < 1e-9);
        assert!((mean + 0.5).abs() < 1e-9);
    }
}
