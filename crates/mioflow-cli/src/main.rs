mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{SummaryArgs, TrainAeArgs, TrainArgs, ValidateArgs};

/// mioflow: learn continuous population dynamics from snapshot data.
#[derive(Parser)]
#[command(name = "mioflow", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for trajectory training, autoencoder pretraining and validation.
#[derive(Subcommand)]
enum Command {
    /// Run the local/global/post-local training regimen on a snapshot file.
    Train {
        /// Path to the mioflow config TOML file. Library defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Path to the snapshot Parquet file.
        #[arg(long)]
        input: PathBuf,
        /// Name of the time-group column.
        #[arg(long, default_value = snapshot::DEFAULT_GROUP_KEY)]
        group_key: String,
        /// Directory for the checkpoint and loss history.
        #[arg(long, default_value = "checkpoints/mioflow")]
        output_dir: PathBuf,
        /// Override the diagnostics directory.
        #[arg(long)]
        exp_dir: Option<String>,
        /// Directory of an autoencoder trained with `train-ae`.
        #[arg(long)]
        autoencoder: Option<PathBuf>,
        /// Leave this group out of training and score it afterwards.
        #[arg(long)]
        hold_out: Option<f64>,
        /// Override the learning rate.
        #[arg(long)]
        lr: Option<f64>,
        /// Seed for mini-batch sampling.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Pretrain the geodesic autoencoder.
    TrainAe {
        /// Path to the mioflow config TOML file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Path to the snapshot Parquet file.
        #[arg(long)]
        input: PathBuf,
        /// Name of the time-group column.
        #[arg(long, default_value = snapshot::DEFAULT_GROUP_KEY)]
        group_key: String,
        /// Directory for the autoencoder checkpoint.
        #[arg(long, default_value = "checkpoints/autoencoder")]
        output_dir: PathBuf,
        /// Seed for sampling and noise.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Score a trained model at a held-out group.
    Validate {
        /// Checkpoint directory written by `train`.
        #[arg(long)]
        checkpoint: PathBuf,
        /// Path to the snapshot Parquet file.
        #[arg(long)]
        input: PathBuf,
        /// Name of the time-group column.
        #[arg(long, default_value = snapshot::DEFAULT_GROUP_KEY)]
        group_key: String,
        /// Held-out group to score.
        #[arg(long)]
        hold_out: f64,
        /// Path to the mioflow config TOML file (criterion and sampling).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Points drawn from the held-out group.
        #[arg(long)]
        sample_size: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print per-group statistics from a snapshot Parquet file.
    Summary {
        /// Path to the snapshot Parquet file.
        #[arg(long)]
        input: PathBuf,
        /// Name of the time-group column.
        #[arg(long, default_value = snapshot::DEFAULT_GROUP_KEY)]
        group_key: String,
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            input,
            group_key,
            output_dir,
            exp_dir,
            autoencoder,
            hold_out,
            lr,
            seed,
        } => pipeline::run_train(TrainArgs {
            config,
            input,
            group_key,
            output_dir,
            exp_dir,
            autoencoder,
            hold_out,
            lr,
            seed,
        }),
        Command::TrainAe {
            config,
            input,
            group_key,
            output_dir,
            seed,
        } => pipeline::run_train_ae(TrainAeArgs {
            config,
            input,
            group_key,
            output_dir,
            seed,
        }),
        Command::Validate {
            checkpoint,
            input,
            group_key,
            hold_out,
            config,
            sample_size,
            seed,
        } => pipeline::run_validate(ValidateArgs {
            checkpoint,
            input,
            group_key,
            hold_out,
            config,
            sample_size,
            seed,
        }),
        Command::Summary {
            input,
            group_key,
            json,
        } => pipeline::run_summary(SummaryArgs {
            input,
            group_key,
            json,
        }),
    }
}
