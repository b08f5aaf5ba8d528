//! TOML config loading for the mioflow CLI.
//!
//! Deserializes `configs/mioflow.toml`, whose `[model]`, `[train]`,
//! `[regimen]`, `[autoencoder]` and `[criterion]` sections hold optional
//! overrides of the library's config defaults, then merges CLI flags on top.

use std::path::Path;

use burn::prelude::Backend;
use mioflow::model::{Activation, GeodesicAutoencoderConfig, OdeModelConfig, Solver};
use mioflow::training::{
    AutoencoderTrainingConfig, Criterion, DistanceFn, EuclideanDistance, HoldOut,
    KnnGeodesicDistance, MmdLoss, RegimenConfig, SinkhornLoss, TrainConfig,
};
use serde::Deserialize;

/// Top-level structure matching `configs/mioflow.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct MioflowToml {
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub train: TrainOverrides,
    #[serde(default)]
    pub regimen: RegimenOverrides,
    #[serde(default)]
    pub autoencoder: AutoencoderOverrides,
    #[serde(default)]
    pub criterion: CriterionOverrides,
}

/// Overrides for `OdeModelConfig`. The dimension comes from the data.
#[derive(Debug, Default, Deserialize)]
pub struct ModelOverrides {
    pub hidden: Option<Vec<usize>>,
    pub activation: Option<Activation>,
    pub growth_rate: Option<bool>,
    pub stochastic: Option<bool>,
    pub m_init: Option<f64>,
    pub solver: Option<Solver>,
    pub n_substeps: Option<usize>,
    pub diffusion_scale: Option<f64>,
}

/// Overrides for `TrainConfig`.
#[derive(Debug, Default, Deserialize)]
pub struct TrainOverrides {
    pub n_batches: Option<usize>,
    pub sample_size: Option<usize>,
    pub sample_with_replacement: Option<bool>,
    pub hold_out: Option<HoldOut>,
    pub use_density_loss: Option<bool>,
    pub density_detach_m: Option<bool>,
    pub top_k: Option<usize>,
    pub hinge_value: Option<f64>,
    pub lambda_density: Option<f64>,
    pub use_emb: Option<bool>,
    pub use_gae: Option<bool>,
    pub add_noise: Option<bool>,
    pub use_gaussian: Option<bool>,
    pub noise_scale: Option<f64>,
    pub lambda_ot: Option<f64>,
    pub lambda_energy: Option<f64>,
    pub lambda_energy_m: Option<f64>,
    pub lambda_m: Option<f64>,
    pub lambda_m2: Option<f64>,
    pub energy_weighted: Option<bool>,
    pub energy_detach_m: Option<bool>,
    pub clip_grad: Option<bool>,
    pub clip_grad_norm: Option<f64>,
    /// A negative factor disables thresholding.
    pub threshold_factor: Option<f64>,
    pub detach_x: Option<bool>,
    pub detach_m: Option<bool>,
    pub diffusion_lambda_energy: Option<f64>,
    pub diffusion_lambda_energy_m: Option<f64>,
    pub diffusion_energy_weighted: Option<bool>,
    pub diffusion_energy_detach_m: Option<bool>,
    pub lr: Option<f64>,
    pub seed: Option<u64>,
}

/// Overrides for `RegimenConfig`.
#[derive(Debug, Default, Deserialize)]
pub struct RegimenOverrides {
    pub n_local_epochs: Option<usize>,
    pub n_epochs: Option<usize>,
    pub n_post_local_epochs: Option<usize>,
    pub reverse_schema: Option<bool>,
    pub reverse_n: Option<usize>,
    pub plot_every: Option<usize>,
    pub n_points: Option<usize>,
    pub n_trajectories: Option<usize>,
    pub n_bins: Option<usize>,
    pub exp_dir: Option<String>,
    pub show_progress: Option<bool>,
}

/// Overrides for the geodesic autoencoder and its training.
#[derive(Debug, Default, Deserialize)]
pub struct AutoencoderOverrides {
    pub latent_dim: Option<usize>,
    pub hidden: Option<Vec<usize>>,
    pub activation: Option<Activation>,
    pub n_epochs: Option<usize>,
    pub recon: Option<bool>,
    pub sample_size: Option<usize>,
    pub sample_with_replacement: Option<bool>,
    pub noise_min_scale: Option<f64>,
    pub noise_max_scale: Option<f64>,
    pub hold_out: Option<HoldOut>,
    pub lr: Option<f64>,
    pub log_every: Option<usize>,
    pub seed: Option<u64>,
    pub distance: Option<DistanceKind>,
    /// Neighbours per point for the geodesic distance.
    pub knn: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceKind {
    None,
    Euclidean,
    Geodesic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    #[default]
    Mmd,
    Sinkhorn,
}

/// Criterion selection plus the parameters of either kind.
#[derive(Debug, Default, Deserialize)]
pub struct CriterionOverrides {
    pub kind: Option<CriterionKind>,
    pub kernel_mul: Option<f64>,
    pub kernel_num: Option<usize>,
    pub weighted: Option<bool>,
    pub epsilon: Option<f64>,
    pub n_iters: Option<usize>,
    pub normalize_cost: Option<bool>,
}

/// Load and deserialize a `MioflowToml` from a TOML file.
pub fn load_mioflow_toml(path: &Path) -> anyhow::Result<MioflowToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: MioflowToml = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded mioflow config");
    Ok(config)
}

/// Load the TOML at `path`, or all defaults when no path is given.
pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<MioflowToml> {
    match path {
        Some(path) => load_mioflow_toml(path),
        None => Ok(MioflowToml::default()),
    }
}

macro_rules! apply {
    ($config:ident, $overrides:expr, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(v) = $overrides.$field.clone() {
                $config.$field = v;
            }
        )*
    };
}

pub fn build_model_config(dim: usize, overrides: &ModelOverrides) -> OdeModelConfig {
    let mut config = OdeModelConfig::new(dim);
    apply!(config, overrides, [
        hidden, activation, growth_rate, stochastic, m_init, solver, n_substeps, diffusion_scale,
    ]);
    config
}

/// CLI flags that override `[train]`.
#[derive(Debug, Default, Clone)]
pub struct TrainCliOverrides {
    pub hold_out: Option<HoldOut>,
    pub lr: Option<f64>,
    pub seed: Option<u64>,
}

/// Build a `TrainConfig`.
///
/// Priority chain: `TrainConfig::new()` defaults < TOML values < CLI flags.
pub fn build_train_config(overrides: &TrainOverrides, cli: &TrainCliOverrides) -> TrainConfig {
    let mut config = TrainConfig::new();
    apply!(config, overrides, [
        n_batches, sample_size, sample_with_replacement, use_density_loss, density_detach_m,
        top_k, hinge_value, lambda_density, use_emb, use_gae, add_noise, use_gaussian,
        noise_scale, lambda_ot, lambda_energy, lambda_energy_m, lambda_m, lambda_m2,
        energy_weighted, energy_detach_m, clip_grad, clip_grad_norm, detach_x, detach_m,
        diffusion_lambda_energy, diffusion_lambda_energy_m, diffusion_energy_weighted,
        diffusion_energy_detach_m, lr,
    ]);
    if overrides.hold_out.is_some() {
        config.hold_out = overrides.hold_out;
    }
    if overrides.seed.is_some() {
        config.seed = overrides.seed;
    }
    if let Some(factor) = overrides.threshold_factor {
        config.threshold_factor = (factor >= 0.0).then_some(factor);
    }

    // CLI overrides take highest priority
    if cli.hold_out.is_some() {
        config.hold_out = cli.hold_out;
    }
    if let Some(lr) = cli.lr {
        config.lr = lr;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    config
}

/// Build a `RegimenConfig` around `train`; a CLI `exp_dir` wins over TOML.
pub fn build_regimen_config(
    overrides: &RegimenOverrides,
    train: TrainConfig,
    exp_dir_cli: Option<String>,
) -> RegimenConfig {
    let mut config = RegimenConfig::new(train);
    apply!(config, overrides, [
        n_local_epochs, n_epochs, n_post_local_epochs, reverse_schema, reverse_n, n_points,
        n_trajectories, n_bins, exp_dir, show_progress,
    ]);
    if overrides.plot_every.is_some() {
        config.plot_every = overrides.plot_every;
    }
    if let Some(dir) = exp_dir_cli {
        config.exp_dir = dir;
    }
    config
}

pub fn build_autoencoder_config(dim: usize, overrides: &AutoencoderOverrides) -> GeodesicAutoencoderConfig {
    let mut config = GeodesicAutoencoderConfig::new(dim);
    apply!(config, overrides, [latent_dim, hidden, activation]);
    config
}

pub fn build_autoencoder_training_config(
    overrides: &AutoencoderOverrides,
    seed_cli: Option<u64>,
) -> AutoencoderTrainingConfig {
    let mut config = AutoencoderTrainingConfig::new();
    apply!(config, overrides, [
        n_epochs, recon, sample_size, sample_with_replacement, noise_min_scale, noise_max_scale,
        lr, log_every,
    ]);
    if overrides.hold_out.is_some() {
        config.hold_out = overrides.hold_out;
    }
    config.seed = seed_cli.or(overrides.seed);
    config
}

/// Distance function for autoencoder training. Defaults to a 5-NN geodesic.
pub fn build_distance(overrides: &AutoencoderOverrides) -> Option<Box<dyn DistanceFn>> {
    match overrides.distance.unwrap_or(DistanceKind::Geodesic) {
        DistanceKind::None => None,
        DistanceKind::Euclidean => Some(Box::new(EuclideanDistance)),
        DistanceKind::Geodesic => Some(Box::new(KnnGeodesicDistance::new(overrides.knn.unwrap_or(5)))),
    }
}

/// The configured distribution-matching criterion.
#[derive(Debug)]
pub enum CriterionChoice {
    Mmd(MmdLoss),
    Sinkhorn(SinkhornLoss),
}

impl CriterionChoice {
    pub fn as_criterion<B: Backend>(&self) -> &dyn Criterion<B> {
        match self {
            CriterionChoice::Mmd(c) => c,
            CriterionChoice::Sinkhorn(c) => c,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CriterionChoice::Mmd(_) => "mmd",
            CriterionChoice::Sinkhorn(_) => "sinkhorn",
        }
    }
}

pub fn build_criterion(overrides: &CriterionOverrides) -> CriterionChoice {
    match overrides.kind.unwrap_or_default() {
        CriterionKind::Mmd => {
            let mut c = MmdLoss::new();
            apply!(c, overrides, [kernel_mul, kernel_num, weighted]);
            CriterionChoice::Mmd(c)
        }
        CriterionKind::Sinkhorn => {
            let mut c = SinkhornLoss::new();
            apply!(c, overrides, [epsilon, n_iters, normalize_cost]);
            CriterionChoice::Sinkhorn(c)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full_mioflow_toml() {
        let toml_str = r#"
[model]
hidden = [32, 32]
activation = "tanh"
growth_rate = true
solver = "euler"
n_substeps = 2

[train]
n_batches = 10
sample_size = 50
hold_out = { group = 2.0 }
lambda_m = 0.5
threshold_factor = -1.0
seed = 7

[regimen]
n_local_epochs = 3
n_epochs = 5
reverse_schema = false
plot_every = 2
exp_dir = "runs/demo"

[autoencoder]
latent_dim = 3
distance = "euclidean"
hold_out = "random"

[criterion]
kind = "sinkhorn"
epsilon = 0.1
"#;
        let parsed: MioflowToml = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.model.hidden, Some(vec![32, 32]));
        assert_eq!(parsed.model.activation, Some(Activation::Tanh));
        assert_eq!(parsed.model.solver, Some(Solver::Euler));
        assert_eq!(parsed.train.hold_out, Some(HoldOut::Group(2.0)));
        assert_eq!(parsed.regimen.plot_every, Some(2));
        assert_eq!(parsed.autoencoder.distance, Some(DistanceKind::Euclidean));
        assert_eq!(parsed.autoencoder.hold_out, Some(HoldOut::Random));
        assert_eq!(parsed.criterion.kind, Some(CriterionKind::Sinkhorn));

        let model = build_model_config(4, &parsed.model);
        assert_eq!(model.dim, 4);
        assert!(model.growth_rate);
        assert_eq!(model.n_substeps, 2);

        let train = build_train_config(&parsed.train, &TrainCliOverrides::default());
        assert_eq!(train.n_batches, 10);
        assert!((train.lambda_m - 0.5).abs() < 1e-12);
        assert_eq!(train.threshold_factor, None, "negative factor disables thresholding");
        assert_eq!(train.seed, Some(7));

        let regimen = build_regimen_config(&parsed.regimen, train, None);
        assert_eq!(regimen.n_epochs, 5);
        assert_eq!(regimen.plot_every, Some(2));
        assert_eq!(regimen.exp_dir, "runs/demo");

        match build_criterion(&parsed.criterion) {
            CriterionChoice::Sinkhorn(c) => {
                assert!((c.epsilon - 0.1).abs() < 1e-12);
                assert_eq!(c.n_iters, 100);
            }
            other => panic!("expected sinkhorn, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let parsed: MioflowToml = toml::from_str("").unwrap();
        let train = build_train_config(&parsed.train, &TrainCliOverrides::default());
        assert_eq!(train.n_batches, 20);
        assert_eq!(train.threshold_factor, Some(0.1));
        assert!(train.hold_out.is_none());

        let regimen = build_regimen_config(&parsed.regimen, train, None);
        assert_eq!(regimen.n_local_epochs, 10);
        assert_eq!(regimen.exp_dir, "experiments");
        assert_eq!(build_criterion(&parsed.criterion).name(), "mmd");
        assert!(build_distance(&parsed.autoencoder).is_some());
    }

    #[test]
    fn test_cli_override_priority() {
        let overrides = TrainOverrides {
            lr: Some(1e-2),
            seed: Some(1),
            hold_out: Some(HoldOut::Random),
            ..Default::default()
        };
        let cli = TrainCliOverrides {
            hold_out: Some(HoldOut::Group(3.0)),
            lr: None,
            seed: Some(42),
        };
        let config = build_train_config(&overrides, &cli);
        assert!((config.lr - 1e-2).abs() < 1e-12, "TOML wins over defaults");
        assert_eq!(config.seed, Some(42), "CLI wins over TOML");
        assert_eq!(config.hold_out, Some(HoldOut::Group(3.0)));

        let regimen = build_regimen_config(
            &RegimenOverrides {
                exp_dir: Some("from_toml".into()),
                ..Default::default()
            },
            config,
            Some("from_cli".into()),
        );
        assert_eq!(regimen.exp_dir, "from_cli");
    }

    #[test]
    fn test_diffusion_energy_flags_from_toml() {
        let parsed: MioflowToml = toml::from_str(
            "[train]\ndiffusion_energy_weighted = false\ndiffusion_energy_detach_m = true\n",
        )
        .unwrap();
        let train = build_train_config(&parsed.train, &TrainCliOverrides::default());
        assert!(!train.diffusion_energy_weighted);
        assert!(train.diffusion_energy_detach_m);

        let defaults = build_train_config(&TrainOverrides::default(), &TrainCliOverrides::default());
        assert!(defaults.diffusion_energy_weighted);
        assert!(!defaults.diffusion_energy_detach_m);
    }

    #[test]
    fn test_autoencoder_configs() {
        let overrides = AutoencoderOverrides {
            latent_dim: Some(5),
            n_epochs: Some(3),
            distance: Some(DistanceKind::None),
            seed: Some(2),
            ..Default::default()
        };
        let model = build_autoencoder_config(8, &overrides);
        assert_eq!((model.dim, model.latent_dim), (8, 5));
        let training = build_autoencoder_training_config(&overrides, None);
        assert_eq!(training.n_epochs, 3);
        assert_eq!(training.seed, Some(2));
        assert!(build_distance(&overrides).is_none());
    }

    #[test]
    fn test_shipped_config_parses() {
        let parsed: MioflowToml = toml::from_str(include_str!("../../../configs/mioflow.toml")).unwrap();
        let model = build_model_config(3, &parsed.model);
        assert_eq!(model.solver, Solver::Rk4);
        assert_eq!(model.activation, Activation::LeakyRelu);
        assert_eq!(build_criterion(&parsed.criterion).name(), "mmd");
        assert_eq!(parsed.autoencoder.distance, Some(DistanceKind::Geodesic));
    }
}
