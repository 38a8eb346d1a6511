//! Tests for checkpoint writing, selection and restore

use std::collections::HashMap;
use std::fs;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::training::checkpoints::{CheckpointManifest, MANIFEST_FILE};
use crate::training::hooks::checkpoint::DataState;
use crate::training::optimizers::schedulers::SchedulerStateDict;
use crate::training::{
    CheckpointHook, CheckpointStore, Context, LrSchedulerConfig, LrSchedulerHook, SchedulerConfig, SchedulerMode,
    SchedulerType,
};
use crate::utils::io;

use super::fixtures::{new_log, recorded, LrRecorder, TrainingTestFixture};

/// Run the fixture from scratch with only a checkpoint hook
fn full_run(fixture: &TrainingTestFixture) -> Result<Vec<Vec<f32>>> {
    let log = new_log();
    let (trainer, _) = fixture.trainer(&log)?;
    let mut trainer = trainer.with_hook(fixture.checkpoint_hook()?);
    fixture.run_recording(&mut trainer, &log)
}

/// Start a new trainer on the fixture's checkpoint folder; returns the
/// batches it processed and the step it restored from
fn resume(fixture: &TrainingTestFixture) -> Result<(Vec<Vec<f32>>, Option<usize>)> {
    let log = new_log();
    let (trainer, _) = fixture.trainer(&log)?;
    let mut trainer = trainer.with_hook(fixture.checkpoint_hook()?);
    let batches = fixture.run_recording(&mut trainer, &log)?;
    let restored = trainer
        .get_hook::<CheckpointHook>()
        .and_then(CheckpointHook::restored_from)
        .map(|info| info.step);
    Ok((batches, restored))
}

fn stored_steps(fixture: &TrainingTestFixture) -> Result<Vec<usize>> {
    let store = CheckpointStore::new(fixture.checkpoint_dir());
    Ok(store.list()?.into_iter().map(|info| info.step).collect())
}

#[test]
fn test_checkpoints_written_at_interval() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    full_run(&fixture)?;

    assert_eq!(stored_steps(&fixture)?, vec![5, 10, 15, 20]);

    let manifest: CheckpointManifest = io::read_json(fixture.checkpoint_path(10).join(MANIFEST_FILE))?;
    assert_eq!(manifest.step, 10);
    assert_eq!(manifest.epoch, 0);
    assert_eq!(
        manifest.files,
        vec!["context.json", "data_state.json", "model_0.safetensors", "optimizer_0.bin"]
    );
    assert_eq!(manifest.version, crate::VERSION);
    Ok(())
}

#[test]
fn test_checkpoint_records_loop_position() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    full_run(&fixture)?;

    let ctx: Context = io::read_json(fixture.checkpoint_path(5).join("context.json"))?;
    assert_eq!(ctx.epoch, 0);
    assert_eq!(ctx.global_step, 4);
    assert_eq!(ctx.batch_index, 4);
    assert_eq!(ctx.iterator_length, 10);
    assert!(ctx.step_loss.is_some());

    let data: DataState = io::read_json(fixture.checkpoint_path(5).join("data_state.json"))?;
    assert_eq!(data, DataState { epoch: 0, consumed: vec![5] });

    let data: DataState = io::read_json(fixture.checkpoint_path(15).join("data_state.json"))?;
    assert_eq!(data, DataState { epoch: 1, consumed: vec![5] });
    Ok(())
}

#[test]
fn test_resume_from_newest_checkpoint() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let original = full_run(&fixture)?;
    fixture.remove_checkpoint(10)?;
    fixture.remove_checkpoint(20)?;

    let (batches, restored) = resume(&fixture)?;

    assert_eq!(restored, Some(15));
    assert_eq!(batches, original[15..].to_vec());
    Ok(())
}

#[test]
fn test_resume_from_only_checkpoint() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let original = full_run(&fixture)?;
    for step in [10, 15, 20] {
        fixture.remove_checkpoint(step)?;
    }

    let (batches, restored) = resume(&fixture)?;

    assert_eq!(restored, Some(5));
    assert_eq!(batches, original[5..].to_vec());
    Ok(())
}

#[test]
fn test_fresh_start_without_checkpoints() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let original = full_run(&fixture)?;
    fs::remove_dir_all(fixture.checkpoint_dir())?;

    let (batches, restored) = resume(&fixture)?;

    assert_eq!(restored, None);
    assert_eq!(batches, original);
    Ok(())
}

#[test]
fn test_completed_run_resumes_to_nothing() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    full_run(&fixture)?;

    let (batches, restored) = resume(&fixture)?;

    assert_eq!(restored, Some(20));
    assert!(batches.is_empty());
    Ok(())
}

#[test]
fn test_corrupt_checkpoint_falls_back() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let original = full_run(&fixture)?;
    fixture.remove_checkpoint(20)?;
    fs::write(fixture.checkpoint_path(15).join("context.json"), b"{ truncated")?;

    let (batches, restored) = resume(&fixture)?;

    assert_eq!(restored, Some(10));
    assert_eq!(batches, original[10..].to_vec());
    Ok(())
}

#[test]
fn test_mismatched_model_falls_back() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let original = full_run(&fixture)?;
    fixture.remove_checkpoint(20)?;
    // a well-formed file whose parameter has the wrong shape
    let tensors = HashMap::from([("w".to_string(), Tensor::zeros(2, DType::F32, &Device::Cpu)?)]);
    candle_core::safetensors::save(&tensors, fixture.checkpoint_path(15).join("model_0.safetensors"))?;

    let (batches, restored) = resume(&fixture)?;

    assert_eq!(restored, Some(10));
    assert_eq!(batches, original[10..].to_vec());
    Ok(())
}

#[test]
fn test_data_state_from_other_epoch_falls_back() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let original = full_run(&fixture)?;
    fixture.remove_checkpoint(20)?;
    let path = fixture.checkpoint_path(15).join("data_state.json");
    let mut data: DataState = io::read_json(&path)?;
    assert_eq!(data.epoch, 1);
    data.epoch = 0;
    io::write_json(&path, &data)?;

    let (batches, restored) = resume(&fixture)?;

    assert_eq!(restored, Some(10));
    assert_eq!(batches, original[10..].to_vec());
    Ok(())
}

#[test]
fn test_uncommitted_checkpoints_are_ignored() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let original = full_run(&fixture)?;
    fs::remove_file(fixture.checkpoint_path(20).join(MANIFEST_FILE))?;
    let stale = fixture.checkpoint_dir().join(".tmp_ckpt_step_25");
    fs::create_dir_all(&stale)?;
    fs::write(stale.join("context.json"), b"{}")?;

    let (batches, restored) = resume(&fixture)?;

    assert_eq!(restored, Some(15));
    assert_eq!(batches, original[15..].to_vec());
    assert!(!stale.exists());
    Ok(())
}

#[test]
fn test_max_to_keep_prunes_oldest() -> Result<()> {
    let mut fixture = TrainingTestFixture::new()?;
    fixture.config.checkpoint.max_to_keep = Some(2);
    full_run(&fixture)?;

    assert_eq!(stored_steps(&fixture)?, vec![15, 20]);
    Ok(())
}

/// Learning rate seen by every step of a run with a linear schedule
fn lr_run(fixture: &TrainingTestFixture) -> Result<Vec<f64>> {
    let rates = new_log();
    let log = new_log();
    let schedule = fixture
        .config
        .lr_scheduler
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("fixture has no schedule"))?;
    let (trainer, _) = fixture.trainer(&log)?;
    let mut trainer = trainer
        .with_hook(LrRecorder {
            rates: std::sync::Arc::clone(&rates),
        })
        .with_hook(LrSchedulerHook::from_config(schedule, fixture.config.optimizer.learning_rate)?)
        .with_hook(fixture.checkpoint_hook()?);
    trainer.run()?;
    Ok(recorded(&rates))
}

fn linear_schedule(mode: SchedulerMode) -> LrSchedulerConfig {
    LrSchedulerConfig {
        mode,
        scheduler: SchedulerConfig {
            scheduler_type: SchedulerType::Linear,
            total_steps: 20,
            warmup_steps: 2,
            min_lr: 0.001,
            ..SchedulerConfig::default()
        },
    }
}

#[test]
fn test_per_step_schedule_resumes() -> Result<()> {
    let mut fixture = TrainingTestFixture::new()?;
    fixture.config.lr_scheduler = Some(linear_schedule(SchedulerMode::PerStep));

    let original = lr_run(&fixture)?;
    assert_eq!(original.len(), 20);
    assert!(original[19] < original[2], "schedule did not decay: {original:?}");

    let manifest: CheckpointManifest = io::read_json(fixture.checkpoint_path(15).join(MANIFEST_FILE))?;
    assert!(manifest.files.iter().any(|file| file == "lr_scheduler.json"));

    fixture.remove_checkpoint(20)?;
    let resumed = lr_run(&fixture)?;
    assert_eq!(resumed, original[15..].to_vec());
    Ok(())
}

#[test]
fn test_schedule_that_fails_to_load_falls_back() -> Result<()> {
    let mut fixture = TrainingTestFixture::new()?;
    fixture.config.lr_scheduler = Some(linear_schedule(SchedulerMode::PerStep));
    let original = lr_run(&fixture)?;
    fixture.remove_checkpoint(20)?;

    // parameters and optimizer state load; the schedule does not
    let path = fixture.checkpoint_path(15).join("lr_scheduler.json");
    let mut state: SchedulerStateDict = io::read_json(&path)?;
    state.scheduler_type = "cosine".to_string();
    io::write_json(&path, &state)?;

    let resumed = lr_run(&fixture)?;
    assert_eq!(resumed, original[10..].to_vec());
    Ok(())
}

#[test]
fn test_schedule_restarts_on_rerun() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let rates = new_log();
    let log = new_log();
    let (trainer, _) = fixture.trainer(&log)?;
    let hook = LrSchedulerHook::from_config(
        &linear_schedule(SchedulerMode::PerStep),
        fixture.config.optimizer.learning_rate,
    )?;
    let mut trainer = trainer
        .with_hook(LrRecorder {
            rates: std::sync::Arc::clone(&rates),
        })
        .with_hook(hook);

    trainer.run()?;
    assert!(trainer.get_hook::<LrSchedulerHook>().is_some_and(|hook| hook.learning_rate() < 0.05));
    trainer.run()?;

    let rates = recorded(&rates);
    assert_eq!(rates.len(), 40);
    assert_eq!(rates[..20], rates[20..]);
    Ok(())
}

#[test]
fn test_per_epoch_schedule_resumes_at_epoch_end() -> Result<()> {
    let mut fixture = TrainingTestFixture::new()?;
    fixture.config.lr_scheduler = Some(linear_schedule(SchedulerMode::PerEpoch));

    let original = lr_run(&fixture)?;
    assert_eq!(original.len(), 20);
    assert_ne!(original[0], original[10]);

    // step 10 was written before the first epoch-end advance
    fixture.remove_checkpoint(15)?;
    fixture.remove_checkpoint(20)?;
    let resumed = lr_run(&fixture)?;
    assert_eq!(resumed, original[10..].to_vec());
    Ok(())
}
