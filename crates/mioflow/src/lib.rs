//! MIOFlow training driver.
//!
//! Fits continuous-time neural ODE/SDE dynamics to snapshot population data
//! (samples at discrete time points with no paired trajectories). Provides the
//! loss terms (OT/MMD matching, density hinge, vector-field energy, mass
//! penalties), local (step-wise) and global (whole trajectory) training, a
//! three-phase training regimen, geodesic autoencoder pretraining and
//! held-out time point validation.

pub mod error;
pub mod inference;
pub mod model;
pub mod training;

pub use error::TrainError;
