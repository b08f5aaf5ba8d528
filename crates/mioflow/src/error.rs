/// Errors that abort a training run.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    /// A growth-rate model was paired with a criterion that ignores mass.
    #[error("model predicts mass but criterion `{0}` does not support mass weights")]
    CriterionWithoutMass(String),
    /// The configured hold-out group is not one of the groups.
    #[error("hold-out group {0} is not one of the training groups")]
    UnknownHoldOut(f64),
    /// Local and global losses were both enabled.
    #[error("using both local and global loss is not supported")]
    CombinedLossUnsupported,
    /// No loss term was selected.
    #[error("no loss selected: enable local or global loss (or recon/distance for the autoencoder)")]
    NoLossSelected,
    /// A loss evaluated to NaN or infinity.
    #[error("non-finite loss {value} at batch {batch}")]
    NonFiniteLoss { batch: usize, value: f64 },
    /// Fewer than two groups, or samples could not be drawn.
    #[error("sampling error: {0}")]
    Sampling(#[source] anyhow::Error),
}
