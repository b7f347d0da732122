// reid-trainer - Person re-identification training
// Main entry point

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};

use reid_trainer::config::{load_config, TrainConfig};
use reid_trainer::errors::{checkpoint_not_found_error, config_parse_error, TrainError};
use reid_trainer::metrics::{aggregate, AGGREGATES_DIR};
use reid_trainer::training::{new_run_id, LogObserver, ProgressObserver, RunContext, Trainer};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "reid-trainer")]
#[command(about = "Person re-identification training with joint softmax/triplet/center losses", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train (or resume) a model
    Train(TrainArgs),
    /// Merge the scalar logs of several runs into per-tag CSV files
    Aggregate {
        /// Directory holding one log directory per run
        #[arg(long = "log-dir")]
        log_dir: PathBuf,
        /// Run ids to aggregate
        #[arg(long, num_args = 1.., required = true)]
        runs: Vec<String>,
        /// Output directory (default: <log-dir>/aggregates)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug)]
struct TrainArgs {
    /// Config file (default: user config dir, then built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the number of epochs
    #[arg(long)]
    epochs: Option<usize>,
    /// Resume from a checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,
    /// Train on a GPU if one is available
    #[arg(long)]
    gpu: bool,
    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Train(train_args) => run_train(train_args),
        Command::Aggregate {
            log_dir,
            runs,
            output,
        } => run_aggregate(&log_dir, &runs, output),
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let config = load_train_config(&args)?;

    // Checked here so a bad path fails before any directory is created
    if let Some(path) = config.resume_path() {
        if !path.exists() {
            anyhow::bail!(checkpoint_not_found_error(&path));
        }
    }

    let settings = config.trainer_settings();
    let run_id = new_run_id();
    let log_dir = RunContext::log_dir_for(settings, &run_id);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    init_tracing(&log_dir);

    let context = RunContext::with_run_id(settings, run_id)
        .context("Failed to initialize run context")?;
    let mut trainer = Trainer::from_config(&config, context).map_err(|e| match e {
        TrainError::CheckpointNotFound(path) => anyhow::anyhow!(checkpoint_not_found_error(&path)),
        other => anyhow::Error::new(other).context("Failed to set up trainer"),
    })?;
    trainer.add_observer(Box::new(ProgressObserver::new()));
    trainer.add_observer(Box::new(LogObserver::new()));

    let summary = trainer.run().context("Training failed")?;

    if let Some(path) = &summary.last_checkpoint {
        println!("Last checkpoint: {}", path.display());
    }
    if let Some(best) = summary.best_accuracy {
        println!("Best validation accuracy: {:.4}", best);
    }
    Ok(())
}

/// Config file plus command-line overrides
fn load_train_config(args: &TrainArgs) -> Result<TrainConfig> {
    let mut config = load_config(args.config.as_deref()).map_err(|e| match (&args.config, e) {
        (Some(path), TrainError::Toml(err)) => anyhow::anyhow!(config_parse_error(path, &err.to_string())),
        (_, other) => anyhow::Error::new(other).context("Failed to load configuration"),
    })?;

    if let Some(epochs) = args.epochs {
        config.trainer_settings_mut().epochs = epochs;
    }
    if let Some(resume) = &args.resume {
        config.resume = resume.display().to_string();
    }
    if args.gpu {
        config.trainer_settings_mut().use_gpu = true;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run_aggregate(log_dir: &Path, runs: &[String], output: Option<PathBuf>) -> Result<()> {
    init_console_tracing();
    let output = output.unwrap_or_else(|| log_dir.join(AGGREGATES_DIR));
    let rows = aggregate(log_dir, runs, &output)
        .with_context(|| format!("Failed to aggregate runs in {}", log_dir.display()))?;

    for (tag, count) in &rows {
        println!("{:30} {} rows", tag, count);
    }
    println!("Wrote {} files to {}", rows.len(), output.display());
    Ok(())
}

/// Console output plus `<log_dir>/train.log`
fn init_tracing(log_dir: &Path) {
    // Default: INFO level, can be overridden with RUST_LOG
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Blocking writer, so nothing is buffered when the log dir is mirrored
    let file_appender = tracing_appender::rolling::never(log_dir, "train.log");
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Bridge log crate → tracing (for dependencies using log crate)
    tracing_log::LogTracer::init().ok();
}

fn init_console_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    tracing_log::LogTracer::init().ok();
}
