//! Training, autoencoder pretraining, validation and summary pipelines.

use std::path::PathBuf;
use std::time::Instant;

use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::prelude::Config;
use rand::rngs::StdRng;
use rand::SeedableRng;

use mioflow::inference::{hold_out_loss, load_autoencoder, load_checkpoint, save_autoencoder, save_checkpoint};
use mioflow::training::{train_ae, training_regimen, HoldOut, SnapshotSampler, TrainContext};
use snapshot::SnapshotReader;

use crate::config::{
    build_autoencoder_config, build_autoencoder_training_config, build_criterion, build_distance,
    build_model_config, build_regimen_config, build_train_config, load_or_default,
    TrainCliOverrides,
};

type TrainBackend = Autodiff<NdArray<f32>>;
type EvalBackend = NdArray<f32>;

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Optional TOML config; defaults apply when absent.
    pub config: Option<PathBuf>,
    /// Snapshot Parquet file.
    pub input: PathBuf,
    /// Name of the time-group column.
    pub group_key: String,
    /// Directory for the checkpoint and loss history.
    pub output_dir: PathBuf,
    /// Diagnostics directory, overriding `[regimen] exp_dir`.
    pub exp_dir: Option<String>,
    /// Directory of an autoencoder saved by `train-ae`.
    pub autoencoder: Option<PathBuf>,
    /// Group to leave out of training.
    pub hold_out: Option<f64>,
    pub lr: Option<f64>,
    pub seed: Option<u64>,
}

/// Arguments for the `train-ae` subcommand.
#[derive(Debug)]
pub struct TrainAeArgs {
    pub config: Option<PathBuf>,
    pub input: PathBuf,
    pub group_key: String,
    /// Directory for the autoencoder checkpoint.
    pub output_dir: PathBuf,
    pub seed: Option<u64>,
}

/// Arguments for the `validate` subcommand.
#[derive(Debug)]
pub struct ValidateArgs {
    /// Checkpoint directory written by `train`.
    pub checkpoint: PathBuf,
    pub input: PathBuf,
    pub group_key: String,
    /// Held-out group to score.
    pub hold_out: f64,
    pub config: Option<PathBuf>,
    pub sample_size: Option<usize>,
    pub seed: Option<u64>,
}

/// Arguments for the `summary` subcommand.
#[derive(Debug)]
pub struct SummaryArgs {
    pub input: PathBuf,
    pub group_key: String,
    /// Output as JSON instead of human-readable text.
    pub json: bool,
}

fn load_sampler(input: &std::path::Path, group_key: &str) -> anyhow::Result<SnapshotSampler> {
    let table = SnapshotReader::read_all(input, group_key)?;
    tracing::info!(
        path = %input.display(),
        rows = table.len(),
        dim = table.dim(),
        "Loaded snapshot table"
    );
    SnapshotSampler::new(table)
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Run the full training regimen and save the model and loss history.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Load config and data
    let toml = load_or_default(args.config.as_deref())?;
    let sampler = load_sampler(&args.input, &args.group_key)?;
    let device = NdArrayDevice::default();

    let cli = TrainCliOverrides {
        hold_out: args.hold_out.map(HoldOut::Group),
        lr: args.lr,
        seed: args.seed,
    };
    let train = build_train_config(&toml.train, &cli);
    let regimen = build_regimen_config(&toml.regimen, train, args.exp_dir);
    let criterion = build_criterion(&toml.criterion);

    // 2. Frozen autoencoder, if any
    let autoencoder = match &args.autoencoder {
        Some(dir) => {
            let (ae, ae_config) = load_autoencoder::<TrainBackend>(dir, &device)?;
            tracing::info!(dir = %dir.display(), latent_dim = ae_config.latent_dim, "Loaded autoencoder");
            Some((ae.no_grad(), ae_config))
        }
        None => None,
    };
    let dim = match &autoencoder {
        Some((_, ae_config)) if regimen.train.use_gae => ae_config.latent_dim,
        _ => sampler.dim(),
    };

    // 3. Build model, optimizer and context
    let model_config = build_model_config(dim, &toml.model);
    let model = model_config.init::<TrainBackend>(&device);
    let mut optimizer = regimen.train.optimizer_config().init();
    let mut rng = regimen.train.rng();
    let mut ctx = TrainContext::new(&sampler, criterion.as_criterion(), device);
    if let Some((ae, _)) = &autoencoder {
        ctx = ctx.with_autoencoder(ae);
    }
    tracing::info!(
        dim,
        groups = sampler.groups().len(),
        criterion = criterion.name(),
        growth_rate = model_config.growth_rate,
        stochastic = model_config.stochastic,
        "Starting training regimen"
    );

    // 4. Train
    let (model, history) = training_regimen(&regimen, model, &mut optimizer, &ctx, &mut rng)?;

    // 5. Save checkpoint, configs and losses
    let model = model.valid();
    save_checkpoint(&model, &model_config, &args.output_dir)?;
    let regimen_path = args.output_dir.join("regimen_config.json");
    regimen
        .save(&regimen_path)
        .map_err(|e| anyhow::anyhow!("Failed to save {}: {e}", regimen_path.display()))?;
    let losses_path = args.output_dir.join("losses.json");
    history.save_json(&losses_path)?;

    // 6. Score a fixed held-out group in feature space
    let held_out = regimen.train.hold_out.and_then(|h| h.fixed());
    let held_out_loss = match held_out {
        Some(group) if dim == sampler.dim() => Some(hold_out_loss(
            &model,
            &sampler,
            sampler.groups(),
            group,
            criterion.as_criterion::<EvalBackend>(),
            regimen.train.sample_size,
            regimen.train.sample_with_replacement,
            &mut rng,
            &device,
        )?),
        Some(group) => {
            tracing::warn!(group, "Model lives in the latent space, skipping held-out validation");
            None
        }
        None => None,
    };

    // 7. Print summary
    let summary = history.summary();
    let elapsed = start.elapsed();
    println!("\n--- Training Summary ---");
    println!("Groups: {:?}", sampler.groups());
    println!("Local batches: {}", summary.n_local_batches);
    println!("Global batches: {}", summary.n_global_batches);
    if let Some(loss) = summary.final_batch {
        println!("Final local loss: {loss:.5}");
    }
    if let Some(loss) = summary.final_global {
        println!("Final global loss: {loss:.5}");
    }
    if let (Some(group), Some(loss)) = (held_out, held_out_loss) {
        println!("Held-out loss ({group}): {loss:.5}");
    }
    println!("Checkpoint: {}", args.output_dir.display());
    println!("Losses: {}", losses_path.display());
    println!("Elapsed: {:.1}s", elapsed.as_secs_f64());

    Ok(())
}

/// Pretrain the geodesic autoencoder and save it.
pub fn run_train_ae(args: TrainAeArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let toml = load_or_default(args.config.as_deref())?;
    let sampler = load_sampler(&args.input, &args.group_key)?;
    let device = NdArrayDevice::default();

    let model_config = build_autoencoder_config(sampler.dim(), &toml.autoencoder);
    let config = build_autoencoder_training_config(&toml.autoencoder, args.seed);
    let distance = build_distance(&toml.autoencoder);
    let model = model_config.init::<TrainBackend>(&device);
    let mut optimizer = config.optimizer_config().init();
    let mut rng = seeded_rng(config.seed);

    tracing::info!(
        dim = model_config.dim,
        latent_dim = model_config.latent_dim,
        epochs = config.n_epochs,
        distance = distance.is_some(),
        "Training autoencoder"
    );
    let (model, losses) = train_ae(
        &config,
        model,
        &mut optimizer,
        &sampler,
        sampler.groups(),
        distance.as_deref(),
        &mut rng,
        &device,
    )?;

    save_autoencoder(&model.valid(), &model_config, &args.output_dir)?;
    let losses_path = args.output_dir.join("autoencoder_losses.json");
    std::fs::write(&losses_path, serde_json::to_string_pretty(&losses)?)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", losses_path.display()))?;

    println!("\n--- Autoencoder Summary ---");
    println!("Epochs: {}", losses.len());
    if let Some(loss) = losses.last() {
        println!("Final loss: {loss:.5}");
    }
    println!("Checkpoint: {}", args.output_dir.display());
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Load a checkpoint and report the loss at a held-out group.
pub fn run_validate(args: ValidateArgs) -> anyhow::Result<()> {
    let toml = load_or_default(args.config.as_deref())?;
    let sampler = load_sampler(&args.input, &args.group_key)?;
    let device = NdArrayDevice::default();
    let (model, model_config) = load_checkpoint::<EvalBackend>(&args.checkpoint, &device)?;
    if model_config.dim != sampler.dim() {
        anyhow::bail!(
            "checkpoint dimension {} does not match the data dimension {}",
            model_config.dim,
            sampler.dim()
        );
    }

    let criterion = build_criterion(&toml.criterion);
    let sample_size = args.sample_size.or(toml.train.sample_size).unwrap_or(100);
    let replace = toml.train.sample_with_replacement.unwrap_or(false);
    let mut rng = seeded_rng(args.seed);
    let loss = hold_out_loss(
        &model,
        &sampler,
        sampler.groups(),
        args.hold_out,
        criterion.as_criterion::<EvalBackend>(),
        sample_size,
        replace,
        &mut rng,
        &device,
    )?;

    println!("--- Held-out Validation ---");
    println!("Checkpoint: {}", args.checkpoint.display());
    println!("Group: {}", args.hold_out);
    println!("Criterion: {}", criterion.name());
    println!("Loss: {loss:.6}");
    Ok(())
}

/// Print statistics from a snapshot Parquet file.
pub fn run_summary(args: SummaryArgs) -> anyhow::Result<()> {
    let summary = SnapshotReader::read_summary(&args.input, &args.group_key)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("--- Snapshot Summary ---");
    println!("File: {}", args.input.display());
    println!("Total rows: {}", summary.total_rows);
    println!("Dimension: {}", summary.dim);
    println!("Groups: {}", summary.groups.len());
    for group in &summary.groups {
        println!("  {:>8}: {}", group.group, group.count);
    }
    Ok(())
}
