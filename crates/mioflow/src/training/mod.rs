//! MIOFlow training pipeline: snapshot sampling, loss terms, loss history,
//! the local/global trainer, the three-phase regimen and autoencoder
//! pretraining.

pub mod autoencoder;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod regimen;
pub mod trainer;

pub use autoencoder::{
    train_ae, AutoencoderTrainingConfig, DistanceFn, EuclideanDistance, KnnGeodesicDistance,
};
pub use data::{generate_steps, step_key, HoldOut, SnapshotSampler};
pub use loss::{Criterion, MmdLoss, SinkhornLoss};
pub use metrics::{LossHistory, StepLosses};
pub use regimen::{training_regimen, RegimenConfig};
pub use trainer::{train, TrainConfig, TrainContext};
