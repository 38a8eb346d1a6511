use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{Init, VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use hurricore::logging::init_logging;
use hurricore::training::{
    create_optimizer, CheckpointHook, CheckpointStore, ConfigRegistry, DataLoader, LoggerHook, LrSchedulerHook,
    MetricHook, RangeDataset, RunConfig, SingleProcess, Trainer, VarMapModel,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "hurricore")]
#[command(about = "Hook-driven training loop engine with exact checkpoint resumption", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "HURRICORE_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a run configuration file
    Config {
        /// Configuration file to validate (JSON or YAML)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List the checkpoints in a folder and the one a restart would resume from
    Checkpoints {
        /// Checkpoint root folder
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Train a small linear regression, resuming from its checkpoints
    Demo {
        /// Run configuration file; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of samples in the synthetic dataset
        #[arg(long, default_value_t = 64)]
        samples: usize,
    },

    /// Show system information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.json)?;

    match cli.command {
        Commands::Config { file } => validate_config(file),
        Commands::Checkpoints { dir } => list_checkpoints(dir),
        Commands::Demo { config, samples } => run_demo(config, samples),
        Commands::Info => {
            show_system_info();
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display())),
        None => Ok(RunConfig::default()),
    }
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());
    let config = load_config(Some(&config_path))?;

    let mut registry = ConfigRegistry::new();
    config.register_all(&mut registry)?;
    println!("Configuration is valid");
    for (name, value) in registry.entries() {
        println!("  {name}: {value}");
    }
    Ok(())
}

fn list_checkpoints(dir: PathBuf) -> Result<()> {
    let store = CheckpointStore::new(&dir);
    let checkpoints = store.list()?;
    if checkpoints.is_empty() {
        println!("No checkpoints in {}", dir.display());
        return Ok(());
    }

    for info in &checkpoints {
        match store.validate(info) {
            Ok(manifest) => println!(
                "  step {:>8}  epoch {:>4}  {}  {} files",
                info.step,
                manifest.epoch,
                manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
                manifest.files.len()
            ),
            Err(err) => println!("  step {:>8}  INVALID: {err}", info.step),
        }
    }
    match store.latest_valid()? {
        Some((info, _)) => println!("A restart resumes from {}", info.path.display()),
        None => println!("No valid checkpoint, a restart starts fresh"),
    }
    Ok(())
}

fn run_demo(config_path: Option<PathBuf>, samples: usize) -> Result<()> {
    let config = load_config(config_path.as_ref())?;
    let mut registry = ConfigRegistry::new();
    config.register_all(&mut registry)?;
    registry.log_all();

    let device = Device::Cpu;
    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
    let weight = vb.get_with_hints((), "weight", Init::Const(0.0))?;
    let bias = vb.get_with_hints((), "bias", Init::Const(0.0))?;
    let model = VarMapModel::new("linear", var_map, device.clone());
    let optimizer = create_optimizer(&config.optimizer, &model)?;

    let dataset = Arc::new(RangeDataset::new(samples, device));
    let loader = DataLoader::new(dataset, config.data.clone());
    let scale = samples.max(1) as f64;

    // fit y = 3x + 1 on x in [0, 1)
    let loss_fn = move |ctx: &hurricore::Context| -> Result<candle_core::Tensor> {
        let x = ctx
            .batch_at(0)
            .context("demo data loader yielded no batch")?
            .affine(1.0 / scale, 0.0)?;
        let target = x.affine(3.0, 1.0)?;
        let prediction = x.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        Ok(prediction.sub(&target)?.sqr()?.mean_all()?)
    };

    let mut trainer = Trainer::new(
        vec![Box::new(model)],
        vec![optimizer],
        vec![Box::new(loader)],
        loss_fn,
        Arc::new(SingleProcess),
        config.trainer.clone(),
    )?;
    trainer.register_hook(LoggerHook::new(config.logger.clone())?);
    if let Some(metrics) = &config.metrics {
        trainer.register_hook(MetricHook::new(metrics.clone())?);
    }
    if let Some(lr_scheduler) = &config.lr_scheduler {
        trainer.register_hook(LrSchedulerHook::from_config(lr_scheduler, config.optimizer.learning_rate)?);
    }
    trainer.register_hook(CheckpointHook::new(config.checkpoint.clone())?);
    info!("{trainer}");

    trainer.run()?;
    Ok(())
}

fn show_system_info() {
    println!("Hurricore - hook-driven training loop engine");
    println!();
    println!("Version: {}", hurricore::VERSION);
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  [x] NVIDIA CUDA");
    #[cfg(not(feature = "cuda"))]
    println!("  [ ] NVIDIA CUDA (not compiled)");

    #[cfg(feature = "metal")]
    println!("  [x] Apple Metal");
    #[cfg(not(feature = "metal"))]
    println!("  [ ] Apple Metal (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  [x] Apple Accelerate");
    #[cfg(not(feature = "accelerate"))]
    println!("  [ ] Apple Accelerate (not compiled)");

    println!("  [x] CPU");
    println!();
    println!("Usage:");
    println!("  hurricore config -f run.yaml        # Validate configuration");
    println!("  hurricore checkpoints -d ckpts      # Inspect a checkpoint folder");
    println!("  hurricore demo -c run.yaml          # Train the demo model");
    println!("  hurricore info                      # Show this information");
}
