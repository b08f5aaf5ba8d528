pub mod autoencoder;
pub mod bridge;
pub mod mlp;
pub mod ode;

pub use autoencoder::{Autoencoder, GeodesicAutoencoder, GeodesicAutoencoderConfig};
pub use mlp::{Activation, Mlp, MlpConfig};
pub use ode::{Drift, OdeModel, OdeModelConfig, Prediction, Solver, TrajectoryModel};
