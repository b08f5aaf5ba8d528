//! Integration tests for the mioflow crate.
//!
//! These tests exercise cross-module interactions: Parquet -> SnapshotSampler,
//! autoencoder pretraining followed by embedded trajectory training, the
//! full training regimen, checkpointing and hold-out evaluation. All use the
//! NdArray backend and small synthetic populations.

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

use mioflow::inference::{
    generate_trajectories, hold_out_loss, load_checkpoint, save_checkpoint, GenerateOptions,
};
use mioflow::model::{GeodesicAutoencoderConfig, OdeModelConfig, Solver};
use mioflow::training::{
    train, train_ae, training_regimen, AutoencoderTrainingConfig, HoldOut, KnnGeodesicDistance,
    LossHistory, MmdLoss, RegimenConfig, SinkhornLoss, SnapshotSampler, TrainConfig, TrainContext,
};
use mioflow::TrainError;
use snapshot::{SnapshotReader, SnapshotTable, SnapshotWriter, DEFAULT_GROUP_KEY};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

/// Helper: a drifting ring population with `n_groups` snapshots.
fn ring_table(n_groups: usize, per_group: usize) -> SnapshotTable {
    let mut table = SnapshotTable::new(vec!["x".into(), "y".into(), "z".into()]);
    for g in 0..n_groups {
        for i in 0..per_group {
            let angle = i as f32 / per_group as f32 * std::f32::consts::TAU;
            let shift = g as f32 * 0.5;
            table
                .push(g as f64, &[angle.cos() + shift, angle.sin(), shift * 0.2])
                .unwrap();
        }
    }
    table
}

/// Helper: write a population to Parquet and load it back into a sampler.
fn sampler_from_parquet(dir: &std::path::Path, table: &SnapshotTable) -> SnapshotSampler {
    let path = dir.join("population.parquet");
    SnapshotWriter::write_table(&path, table, DEFAULT_GROUP_KEY).unwrap();
    let loaded = SnapshotReader::read_all(&path, DEFAULT_GROUP_KEY).unwrap();
    SnapshotSampler::new(loaded).unwrap()
}

// ---------------------------------------------------------------------------
// Test 1: Parquet -> sampler -> local training
// ---------------------------------------------------------------------------

#[test]
fn test_parquet_to_local_training() {
    let tmp = TempDir::new().unwrap();
    let sampler = sampler_from_parquet(tmp.path(), &ring_table(3, 16));
    assert_eq!(sampler.groups(), &[0.0, 1.0, 2.0]);
    assert_eq!(sampler.dim(), 3);

    let device = Default::default();
    let criterion = MmdLoss::new();
    let ctx = TrainContext::<TestAutodiffBackend>::new(&sampler, &criterion, device);
    let model = OdeModelConfig::new(3)
        .with_hidden(vec![16])
        .with_n_substeps(1)
        .init(&Default::default());
    let config = TrainConfig::new()
        .with_n_batches(3)
        .with_sample_size(8)
        .with_seed(Some(11));
    let mut optimizer = config.optimizer_config().init();
    let mut rng = config.rng();

    let (_, history) = train(&config, model, &mut optimizer, &ctx, &mut rng).unwrap();
    assert_eq!(history.batch.len(), 3);
    assert!(history.global.is_empty());
    for key in ["0.0:1.0", "1.0:2.0"] {
        let losses = history.local_losses(key).unwrap();
        assert_eq!(losses.len(), 3, "one entry per batch for {key}");
        assert!(losses.iter().all(|l| l.is_finite()));
    }
}

// ---------------------------------------------------------------------------
// Test 2: Growth-rate model with Sinkhorn and mass penalties
// ---------------------------------------------------------------------------

#[test]
fn test_growth_model_global_training_with_mass() {
    let sampler = SnapshotSampler::new(ring_table(3, 12)).unwrap();
    let criterion = SinkhornLoss::new().with_n_iters(20);
    let ctx = TrainContext::<TestAutodiffBackend>::new(&sampler, &criterion, Default::default());
    let model = OdeModelConfig::new(3)
        .with_hidden(vec![8])
        .with_growth_rate(true)
        .with_solver(Solver::Euler)
        .with_n_substeps(2)
        .init(&Default::default());
    let config = TrainConfig::new()
        .with_n_batches(2)
        .with_sample_size(6)
        .with_local_loss(false)
        .with_global_loss(true)
        .with_lambda_m(0.5)
        .with_lambda_m2(0.5)
        .with_clip_grad(true)
        .with_seed(Some(5));
    let mut optimizer = config.optimizer_config().init();
    let mut rng = config.rng();

    let (_, history) = train(&config, model, &mut optimizer, &ctx, &mut rng).unwrap();
    assert_eq!(history.global.len(), 2);
    assert!(history.global.iter().all(|l| l.is_finite()));
}

// ---------------------------------------------------------------------------
// Test 3: Autoencoder pretraining, then training in the latent space (GAE)
// ---------------------------------------------------------------------------

#[test]
fn test_autoencoder_then_embedded_training() {
    let device = Default::default();
    let sampler = SnapshotSampler::new(ring_table(3, 12)).unwrap();

    let ae = GeodesicAutoencoderConfig::new(3)
        .with_latent_dim(2)
        .with_hidden(vec![8])
        .init::<TestAutodiffBackend>(&device);
    let ae_config = AutoencoderTrainingConfig::new()
        .with_n_epochs(4)
        .with_sample_size(6)
        .with_hold_out(Some(HoldOut::Group(1.0)));
    let mut ae_optimizer = ae_config.optimizer_config().init();
    let mut rng = StdRng::seed_from_u64(21);
    let distance = KnnGeodesicDistance::new(4);
    let (ae, ae_losses) = train_ae(
        &ae_config,
        ae,
        &mut ae_optimizer,
        &sampler,
        sampler.groups(),
        Some(&distance),
        &mut rng,
        &device,
    )
    .unwrap();
    assert_eq!(ae_losses.len(), 4);

    // Trajectories live in the 2-d latent space.
    let criterion = MmdLoss::new();
    let ctx = TrainContext::<TestAutodiffBackend>::new(&sampler, &criterion, device)
        .with_autoencoder(&ae);
    let model = OdeModelConfig::new(2)
        .with_hidden(vec![8])
        .with_n_substeps(1)
        .init(&Default::default());
    let config = TrainConfig::new()
        .with_n_batches(2)
        .with_sample_size(6)
        .with_use_gae(true)
        .with_use_density_loss(false);
    let mut optimizer = config.optimizer_config().init();

    let (model, history) = train(&config, model, &mut optimizer, &ctx, &mut rng).unwrap();
    assert_eq!(history.batch.len(), 2);

    let generated = generate_trajectories(
        &model,
        &sampler,
        sampler.groups(),
        GenerateOptions {
            n_points: 5,
            n_trajectories: 3,
            n_bins: 6,
            sample_with_replacement: false,
            recon: true,
        },
        Some(&ae),
        &mut rng,
        &Default::default(),
    )
    .unwrap();
    assert_eq!(generated.generated.len(), 3);
    // Decoded back to the feature space.
    assert!(generated.generated[0].iter().all(|row| row.len() == 3));
    assert_eq!(generated.trajectories.len(), 6);
}

// ---------------------------------------------------------------------------
// Test 4: Regimen -> checkpoint -> hold-out loss
// ---------------------------------------------------------------------------

#[test]
fn test_regimen_checkpoint_and_hold_out() {
    let tmp = TempDir::new().unwrap();
    let sampler = SnapshotSampler::new(ring_table(4, 10)).unwrap();
    let criterion = MmdLoss::new();
    let ctx = TrainContext::<TestAutodiffBackend>::new(&sampler, &criterion, Default::default());

    let model_config = OdeModelConfig::new(3).with_hidden(vec![8]).with_n_substeps(1);
    let model = model_config.init::<TestAutodiffBackend>(&Default::default());
    let train_config = TrainConfig::new()
        .with_n_batches(1)
        .with_sample_size(5)
        .with_hold_out(Some(HoldOut::Group(2.0)))
        .with_seed(Some(9));
    let config = RegimenConfig::new(train_config)
        .with_n_local_epochs(1)
        .with_n_epochs(1)
        .with_reverse_schema(false)
        .with_show_progress(false)
        .with_plot_every(Some(1))
        .with_n_points(4)
        .with_n_trajectories(2)
        .with_n_bins(3)
        .with_exp_dir(tmp.path().join("run").to_string_lossy().into_owned());
    let mut optimizer = config.train.optimizer_config().init();
    let mut rng = config.train.rng();

    let (model, history) = training_regimen(&config, model, &mut optimizer, &ctx, &mut rng).unwrap();
    // The held-out group is skipped: steps bridge 1.0 -> 3.0.
    let keys: Vec<&str> = history.keys().collect();
    assert_eq!(keys, vec!["0.0:1.0", "1.0:3.0"]);
    let saved = LossHistory::load_json(&tmp.path().join("run").join("losses_l1_e1_ple0.json")).unwrap();
    assert_eq!(saved, history);

    let inner = model.valid();
    let ckpt = tmp.path().join("ckpt");
    save_checkpoint(&inner, &model_config, &ckpt).unwrap();
    let (loaded, loaded_config) = load_checkpoint::<TestBackend>(&ckpt, &Default::default()).unwrap();
    assert_eq!(loaded_config.dim, 3);

    let mut eval_rng = StdRng::seed_from_u64(1);
    let loss = hold_out_loss(
        &loaded,
        &sampler,
        sampler.groups(),
        2.0,
        &MmdLoss::new(),
        5,
        false,
        &mut eval_rng,
        &Default::default(),
    )
    .unwrap();
    assert!(loss.is_finite() && loss >= 0.0);
}

// ---------------------------------------------------------------------------
// Test 5: Configuration errors surface before any training
// ---------------------------------------------------------------------------

#[test]
fn test_unknown_hold_out_is_rejected() {
    let sampler = SnapshotSampler::new(ring_table(3, 6)).unwrap();
    let criterion = MmdLoss::new();
    let ctx = TrainContext::<TestAutodiffBackend>::new(&sampler, &criterion, Default::default());
    let model = OdeModelConfig::new(3).with_hidden(vec![4]).init(&Default::default());
    let config = TrainConfig::new()
        .with_n_batches(1)
        .with_hold_out(Some(HoldOut::Group(7.0)));
    let mut optimizer = config.optimizer_config().init();
    let mut rng = StdRng::seed_from_u64(0);

    let err = train(&config, model, &mut optimizer, &ctx, &mut rng).unwrap_err();
    assert!(matches!(err, TrainError::UnknownHoldOut(g) if g == 7.0));
}
