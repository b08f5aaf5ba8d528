//! Trajectory generation, held-out time point validation and checkpoints.
//!
//! `generate_trajectories` produces the data behind the training diagnostics:
//! the populations the model predicts at every group time, and dense
//! trajectories over an even time grid. `hold_out_loss` scores the
//! prediction at a time point that was left out of training.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use rand::Rng;

use snapshot::{SnapshotTable, TrajectoryFrame};

use crate::model::autoencoder::{Autoencoder, GeodesicAutoencoder, GeodesicAutoencoderConfig};
use crate::model::bridge::{tensor_to_f64, tensor_to_rows};
use crate::model::ode::{OdeModel, OdeModelConfig, TrajectoryModel};
use crate::training::data::SnapshotSampler;
use crate::training::loss::Criterion;

/// Model output for diagnostics.
#[derive(Debug, Clone)]
pub struct GeneratedData {
    /// Group times the populations were predicted at.
    pub groups: Vec<f64>,
    /// Predicted population at each group, one row per point.
    pub generated: Vec<Vec<Vec<f32>>>,
    /// Positions of every trajectory at each time of the grid.
    pub trajectories: Vec<TrajectoryFrame>,
}

impl GeneratedData {
    /// The predicted populations as a snapshot table labelled by group.
    pub fn generated_table(&self, feature_names: Vec<String>) -> anyhow::Result<SnapshotTable> {
        let mut table = SnapshotTable::new(feature_names);
        for (&group, rows) in self.groups.iter().zip(&self.generated) {
            for row in rows {
                table.push(group, row)?;
            }
        }
        Ok(table)
    }
}

/// Options for [`generate_trajectories`].
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    /// Points integrated to every group time.
    pub n_points: usize,
    /// Points integrated along the dense time grid.
    pub n_trajectories: usize,
    /// Size of the dense time grid.
    pub n_bins: usize,
    pub sample_with_replacement: bool,
    /// Encode inputs and decode outputs through the autoencoder.
    pub recon: bool,
}

/// `n` evenly spaced times from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

fn decode<B: Backend>(
    x: Tensor<B, 2>,
    autoencoder: Option<&dyn Autoencoder<B>>,
    recon: bool,
) -> Tensor<B, 2> {
    match (recon, autoencoder) {
        (true, Some(ae)) => ae.decode(x),
        _ => x,
    }
}

fn encode<B: Backend>(
    x: Tensor<B, 2>,
    autoencoder: Option<&dyn Autoencoder<B>>,
    recon: bool,
) -> Tensor<B, 2> {
    match (recon, autoencoder) {
        (true, Some(ae)) => ae.encode(x),
        _ => x,
    }
}

/// Integrate samples of the first group to every group time and along an
/// even grid of `n_bins` times spanning the groups.
///
/// # Errors
/// Fails when `groups` is empty or the first group cannot be sampled.
#[allow(clippy::too_many_arguments)]
pub fn generate_trajectories<B: Backend, M: TrajectoryModel<B>>(
    model: &M,
    sampler: &SnapshotSampler,
    groups: &[f64],
    options: GenerateOptions,
    autoencoder: Option<&dyn Autoencoder<B>>,
    rng: &mut impl Rng,
    device: &B::Device,
) -> anyhow::Result<GeneratedData> {
    let (&first, &last) = match (groups.first(), groups.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => anyhow::bail!("cannot generate trajectories without groups"),
    };
    let replace = options.sample_with_replacement;

    let x0 = sampler.sample::<B>(first, options.n_points, replace, rng, device)?;
    let x0 = encode(x0, autoencoder, options.recon);
    let prediction = model.integrate(x0, groups);
    let generated = prediction
        .positions
        .into_iter()
        .map(|x| tensor_to_rows(decode(x, autoencoder, options.recon)))
        .collect();

    let times = linspace(first, last, options.n_bins.max(2));
    let x0 = sampler.sample::<B>(first, options.n_trajectories, replace, rng, device)?;
    let x0 = encode(x0, autoencoder, options.recon);
    let dense = model.integrate(x0, &times);
    let trajectories = dense
        .positions
        .into_iter()
        .zip(&times)
        .map(|(x, &time)| TrajectoryFrame {
            time,
            points: tensor_to_rows(decode(x, autoencoder, options.recon)),
        })
        .collect();

    tracing::debug!(
        groups = groups.len(),
        n_points = options.n_points,
        n_trajectories = options.n_trajectories,
        n_bins = times.len(),
        "generated trajectories"
    );

    Ok(GeneratedData {
        groups: groups.to_vec(),
        generated,
        trajectories,
    })
}

/// Criterion between the prediction at `held_out` and fresh samples of it.
///
/// Samples of the first group are integrated through every group time;
/// growth-rate predictions are compared with their masses when the
/// criterion supports them.
///
/// # Errors
/// Fails when `held_out` is not one of `groups` or sampling fails.
#[allow(clippy::too_many_arguments)]
pub fn hold_out_loss<B: Backend, M: TrajectoryModel<B>>(
    model: &M,
    sampler: &SnapshotSampler,
    groups: &[f64],
    held_out: f64,
    criterion: &dyn Criterion<B>,
    sample_size: usize,
    sample_with_replacement: bool,
    rng: &mut impl Rng,
    device: &B::Device,
) -> anyhow::Result<f64> {
    let idx = groups
        .iter()
        .position(|&g| g == held_out)
        .ok_or_else(|| anyhow::anyhow!("held-out group {held_out} is not one of the groups"))?;

    let x0 = sampler.sample::<B>(groups[0], sample_size, sample_with_replacement, rng, device)?;
    let prediction = model.integrate(x0, groups);
    let (x, m) = prediction.at(idx);
    let target = sampler.sample::<B>(held_out, sample_size, sample_with_replacement, rng, device)?;

    let loss = match m {
        Some(m) if criterion.supports_mass() => criterion.weighted_loss(x, target, m),
        _ => criterion.loss(x, target),
    };
    let value = tensor_to_f64(loss);
    tracing::info!(held_out, loss = value, criterion = criterion.name(), "hold-out loss");
    Ok(value)
}

/// Paths of a saved model checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointPaths {
    /// Model weights, without the `.mpk` extension the recorder adds.
    pub model: PathBuf,
    /// Model configuration (JSON).
    pub config: PathBuf,
}

impl CheckpointPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self::named(dir, "model")
    }

    /// `<dir>/<stem>` weights and `<dir>/<stem>_config.json`.
    pub fn named(dir: &Path, stem: &str) -> Self {
        Self {
            model: dir.join(stem),
            config: dir.join(format!("{stem}_config.json")),
        }
    }
}

const AUTOENCODER_STEM: &str = "autoencoder";

/// Save an [`OdeModel`] and its configuration under `dir`.
pub fn save_checkpoint<B: Backend>(
    model: &OdeModel<B>,
    config: &OdeModelConfig,
    dir: &Path,
) -> anyhow::Result<CheckpointPaths> {
    std::fs::create_dir_all(dir)?;
    let paths = CheckpointPaths::in_dir(dir);
    model
        .clone()
        .save_file(&paths.model, &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
        .map_err(|e| anyhow::anyhow!("Failed to save model to {}: {e}", paths.model.display()))?;
    config
        .save(&paths.config)
        .map_err(|e| anyhow::anyhow!("Failed to save model config to {}: {e}", paths.config.display()))?;
    tracing::info!(dir = %dir.display(), "Checkpoint saved (model + config)");
    Ok(paths)
}

/// Load an [`OdeModel`] saved by [`save_checkpoint`].
pub fn load_checkpoint<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> anyhow::Result<(OdeModel<B>, OdeModelConfig)> {
    let paths = CheckpointPaths::in_dir(dir);
    let config = OdeModelConfig::load(&paths.config)
        .map_err(|e| anyhow::anyhow!("Failed to load model config from {}: {e}", paths.config.display()))?;
    let model = config
        .init::<B>(device)
        .load_file(&paths.model, &NamedMpkFileRecorder::<FullPrecisionSettings>::new(), device)
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", paths.model.display()))?;
    Ok((model, config))
}

/// Save a [`GeodesicAutoencoder`] and its configuration under `dir`.
pub fn save_autoencoder<B: Backend>(
    model: &GeodesicAutoencoder<B>,
    config: &GeodesicAutoencoderConfig,
    dir: &Path,
) -> anyhow::Result<CheckpointPaths> {
    std::fs::create_dir_all(dir)?;
    let paths = CheckpointPaths::named(dir, AUTOENCODER_STEM);
    model
        .clone()
        .save_file(&paths.model, &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
        .map_err(|e| anyhow::anyhow!("Failed to save autoencoder to {}: {e}", paths.model.display()))?;
    config
        .save(&paths.config)
        .map_err(|e| anyhow::anyhow!("Failed to save autoencoder config to {}: {e}", paths.config.display()))?;
    tracing::info!(dir = %dir.display(), "Autoencoder saved");
    Ok(paths)
}

/// Load a [`GeodesicAutoencoder`] saved by [`save_autoencoder`].
pub fn load_autoencoder<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> anyhow::Result<(GeodesicAutoencoder<B>, GeodesicAutoencoderConfig)> {
    let paths = CheckpointPaths::named(dir, AUTOENCODER_STEM);
    let config = GeodesicAutoencoderConfig::load(&paths.config).map_err(|e| {
        anyhow::anyhow!("Failed to load autoencoder config from {}: {e}", paths.config.display())
    })?;
    let model = config
        .init::<B>(device)
        .load_file(&paths.model, &NamedMpkFileRecorder::<FullPrecisionSettings>::new(), device)
        .map_err(|e| anyhow::anyhow!("Failed to load autoencoder from {}: {e}", paths.model.display()))?;
    Ok((model, config))
}
