//! Three-phase MIOFlow training regimen.
//!
//! Local pretraining, then global training, then local post-training, each
//! phase a sequence of [`train`] calls. With the reverse schema, every
//! `reverse_n`-th epoch trains backwards in time.

use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;

use snapshot::{default_feature_names, SnapshotWriter};

use crate::inference::{generate_trajectories, GenerateOptions};
use crate::model::ode::TrajectoryModel;
use crate::training::data::{generate_steps, step_key};
use crate::training::metrics::LossHistory;
use crate::training::trainer::{groups_without, train, TrainConfig, TrainContext};

/// Configuration for [`training_regimen`].
#[derive(Config, Debug)]
pub struct RegimenConfig {
    /// Local pretraining epochs.
    #[config(default = 10)]
    pub n_local_epochs: usize,
    /// Global training epochs.
    #[config(default = 30)]
    pub n_epochs: usize,
    /// Local post-training epochs.
    #[config(default = 0)]
    pub n_post_local_epochs: usize,
    /// Train every `reverse_n`-th epoch backwards in time.
    #[config(default = true)]
    pub reverse_schema: bool,
    #[config(default = 4)]
    pub reverse_n: usize,
    /// Write diagnostics every this many epochs. `None` writes nothing.
    pub plot_every: Option<usize>,
    /// Points integrated to every group time in diagnostics.
    #[config(default = 100)]
    pub n_points: usize,
    /// Trajectories integrated over the dense grid in diagnostics.
    #[config(default = 100)]
    pub n_trajectories: usize,
    /// Dense grid size for diagnostic trajectories.
    #[config(default = 100)]
    pub n_bins: usize,
    /// Directory for diagnostics.
    #[config(default = "String::from(\"experiments\")")]
    pub exp_dir: String,
    #[config(default = true)]
    pub show_progress: bool,
    /// Per-epoch training settings. The regime flags are set by each phase.
    pub train: TrainConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Local,
    Global,
    PostLocal,
}

impl Phase {
    fn epochs(self, config: &RegimenConfig) -> usize {
        match self {
            Phase::Local => config.n_local_epochs,
            Phase::Global => config.n_epochs,
            Phase::PostLocal => config.n_post_local_epochs,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Phase::Local => "Pretraining Epoch",
            Phase::Global => "Epoch",
            Phase::PostLocal => "Posttraining Epoch",
        }
    }

    /// Diagnostics file stem for `epoch` of this phase.
    fn diagnostics_name(self, config: &RegimenConfig, epoch: usize) -> String {
        let local = config.n_local_epochs;
        let global = config.n_epochs;
        match self {
            Phase::Local => format!("comparison_local_{epoch}"),
            Phase::Global => format!("comparison_local_{local}_global_{epoch}"),
            Phase::PostLocal => format!("comparison_local_{local}_global_{global}_post_{epoch}"),
        }
    }

    fn train_config(self, base: &TrainConfig, reverse: bool) -> TrainConfig {
        let global = self == Phase::Global;
        base.clone()
            .with_local_loss(!global)
            .with_global_loss(global)
            .with_apply_losses_in_time(true)
            .with_reverse(reverse)
    }
}

/// File name of the final loss history.
pub fn losses_file_name(config: &RegimenConfig) -> String {
    format!(
        "losses_l{}_e{}_ple{}.json",
        config.n_local_epochs, config.n_epochs, config.n_post_local_epochs
    )
}

fn progress_bar(len: usize, show: bool, description: &str) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .expect("valid progress bar template")
            .progress_chars("=> "),
    );
    pb.set_message(description.to_string());
    pb
}

/// Write generated populations, trajectories and the loss history so far.
fn write_diagnostics<B, M>(
    config: &RegimenConfig,
    name: &str,
    model: &M,
    ctx: &TrainContext<'_, B>,
    history: &LossHistory,
    rng: &mut impl Rng,
) -> anyhow::Result<()>
where
    B: Backend,
    M: TrajectoryModel<B>,
{
    let dir = Path::new(&config.exp_dir);
    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", dir.display()))?;

    let options = GenerateOptions {
        n_points: config.n_points,
        n_trajectories: config.n_trajectories,
        n_bins: config.n_bins,
        sample_with_replacement: config.train.sample_with_replacement,
        recon: config.train.use_gae && !config.train.use_emb,
    };
    let data = generate_trajectories(
        model,
        ctx.sampler,
        &ctx.groups,
        options,
        ctx.autoencoder,
        rng,
        &ctx.device,
    )?;

    // Latent-space output gets generic column names.
    let out_dim = data
        .trajectories
        .first()
        .and_then(|f| f.points.first())
        .map_or(ctx.sampler.dim(), Vec::len);
    let names = if out_dim == ctx.sampler.dim() {
        ctx.sampler.table().feature_names().to_vec()
    } else {
        default_feature_names(out_dim)
    };

    SnapshotWriter::write_trajectories(&dir.join(format!("{name}.parquet")), &data.trajectories, &names)?;
    let generated = data.generated_table(names)?;
    SnapshotWriter::write_table(
        &dir.join(format!("{name}_generated.parquet")),
        &generated,
        snapshot::DEFAULT_GROUP_KEY,
    )?;
    history.save_json(&dir.join(format!("{name}.json")))?;

    tracing::info!(name, dir = %dir.display(), "Diagnostics written");
    Ok(())
}

/// Run local pretraining, global training and local post-training.
///
/// The returned history is seeded with the forward step keys (and the
/// reversed keys under the reverse schema), minus a fixed hold-out group.
/// Under the reverse schema the reversed-step losses are folded back into
/// their forward step at the end.
pub fn training_regimen<B, M, O>(
    config: &RegimenConfig,
    mut model: M,
    optimizer: &mut O,
    ctx: &TrainContext<'_, B>,
    rng: &mut impl Rng,
) -> anyhow::Result<(M, LossHistory)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + TrajectoryModel<B>,
    O: Optimizer<M, B>,
{
    if config.reverse_schema && config.reverse_n == 0 {
        anyhow::bail!("reverse_n must be > 0 when reverse_schema is enabled");
    }

    let fixed_hold_out = config.train.hold_out.and_then(|h| h.fixed());
    let kept = groups_without(&ctx.groups, fixed_hold_out);
    let forward_steps = generate_steps(&kept);

    let mut history = LossHistory::with_steps(&forward_steps);
    if config.reverse_schema {
        let mut reversed = kept.clone();
        reversed.reverse();
        for (t0, t1) in generate_steps(&reversed) {
            history.entry(&step_key(t0, t1));
        }
    }

    tracing::info!(
        n_local_epochs = config.n_local_epochs,
        n_epochs = config.n_epochs,
        n_post_local_epochs = config.n_post_local_epochs,
        reverse_schema = config.reverse_schema,
        groups = ctx.groups.len(),
        "Starting training regimen"
    );

    for phase in [Phase::Local, Phase::Global, Phase::PostLocal] {
        let epochs = phase.epochs(config);
        if epochs == 0 {
            continue;
        }
        let pb = progress_bar(epochs, config.show_progress, phase.description());

        for epoch in 0..epochs {
            let reverse = config.reverse_schema && epoch % config.reverse_n == 0;
            let train_config = phase.train_config(&config.train, reverse);

            let (updated, epoch_history) = train(&train_config, model, optimizer, ctx, rng)?;
            model = updated;
            if let Some(loss) = epoch_history.last() {
                pb.set_message(format!("{} loss={loss:.4}", phase.description()));
            }
            history.merge(epoch_history);

            if let Some(every) = config.plot_every.filter(|&n| n > 0) {
                if epoch % every == 0 {
                    let name = phase.diagnostics_name(config, epoch);
                    write_diagnostics(config, &name, &model, ctx, &history, rng)?;
                }
            }
            pb.inc(1);
        }
        pb.finish_with_message(format!("{} done", phase.description()));
    }

    if config.reverse_schema {
        history.interleave_reversed(&forward_steps, config.reverse_n);
    }

    if config.plot_every.is_some() {
        let dir = Path::new(&config.exp_dir);
        std::fs::create_dir_all(dir)?;
        let path: PathBuf = dir.join(losses_file_name(config));
        history.save_json(&path)?;
        tracing::info!(path = %path.display(), "Loss history written");
    }

    Ok((model, history))
}
