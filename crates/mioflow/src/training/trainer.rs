//! MIOFlow training loop: local (per consecutive time pair) and global
//! (whole trajectory) regimes over unpaired snapshot mini-batches.

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::TrainError;
use crate::model::autoencoder::Autoencoder;
use crate::model::bridge::{noise_tensor, tensor_to_f64};
use crate::model::ode::{Drift, TrajectoryModel};
use crate::training::data::{generate_steps, step_key, HoldOut, SnapshotSampler};
use crate::training::loss::{
    density_loss, energy_loss_seq, field_energy, growth_energy_loss_seq, mass_mean_loss,
    mass_point_loss, subset_threshold, Criterion,
};
use crate::training::metrics::LossHistory;

/// Configuration for one call of [`train`].
#[derive(Config, Debug)]
pub struct TrainConfig {
    /// Batches per call.
    #[config(default = 20)]
    pub n_batches: usize,
    /// Points drawn from each group per step.
    #[config(default = 100)]
    pub sample_size: usize,
    #[config(default = false)]
    pub sample_with_replacement: bool,

    /// Step-wise loss between consecutive groups.
    #[config(default = true)]
    pub local_loss: bool,
    /// Whole-trajectory loss.
    #[config(default = false)]
    pub global_loss: bool,
    /// Local mode: back-propagate and step after every time pair instead of
    /// once per batch.
    #[config(default = true)]
    pub apply_losses_in_time: bool,
    /// Group left out of training. `None` trains on every group.
    pub hold_out: Option<HoldOut>,
    /// Train with the group order reversed (backwards in time).
    #[config(default = false)]
    pub reverse: bool,

    #[config(default = true)]
    pub use_density_loss: bool,
    /// Detach the masses used as density weights.
    #[config(default = true)]
    pub density_detach_m: bool,
    /// Nearest targets per point in the density loss.
    #[config(default = 5)]
    pub top_k: usize,
    #[config(default = 0.01)]
    pub hinge_value: f64,
    #[config(default = 1.0)]
    pub lambda_density: f64,

    /// Compare prediction and target in the autoencoder's embedding.
    #[config(default = false)]
    pub use_emb: bool,
    /// Encode the samples before integrating (the model lives in latent space).
    #[config(default = false)]
    pub use_gae: bool,

    #[config(default = false)]
    pub add_noise: bool,
    /// Gaussian noise if set, uniform `[0, 1)` noise otherwise.
    #[config(default = true)]
    pub use_gaussian: bool,
    #[config(default = 0.1)]
    pub noise_scale: f64,

    #[config(default = 1.0)]
    pub lambda_ot: f64,
    #[config(default = 1.0)]
    pub lambda_energy: f64,
    #[config(default = 1.0)]
    pub lambda_energy_m: f64,
    /// Penalty on the mean mass per time point drifting from `m_init`.
    #[config(default = 0.0)]
    pub lambda_m: f64,
    /// Penalty on every point's mass drifting from `m_init`.
    #[config(default = 0.0)]
    pub lambda_m2: f64,
    #[config(default = true)]
    pub energy_weighted: bool,
    #[config(default = false)]
    pub energy_detach_m: bool,

    #[config(default = false)]
    pub clip_grad: bool,
    #[config(default = 1.0)]
    pub clip_grad_norm: f64,

    /// Drop predicted points lighter than `factor · mean mass` before
    /// matching. `None` keeps every point.
    #[config(default = "Some(0.1)")]
    pub threshold_factor: Option<f64>,
    #[config(default = false)]
    pub detach_x: bool,
    #[config(default = false)]
    pub detach_m: bool,

    #[config(default = 1.0)]
    pub diffusion_lambda_energy: f64,
    #[config(default = 1.0)]
    pub diffusion_lambda_energy_m: f64,
    #[config(default = true)]
    pub diffusion_energy_weighted: bool,
    #[config(default = false)]
    pub diffusion_energy_detach_m: bool,

    /// Adam learning rate.
    #[config(default = 1e-3)]
    pub lr: f64,
    /// Seed for mini-batch sampling, hold-out picks and input noise. The
    /// Euler-Maruyama noise of stochastic models is not covered. `None`
    /// seeds from entropy.
    pub seed: Option<u64>,
}

impl TrainConfig {
    /// Adam with gradient-norm clipping when `clip_grad` is set.
    pub fn optimizer_config(&self) -> AdamConfig {
        let clipping = self
            .clip_grad
            .then(|| GradientClippingConfig::Norm(self.clip_grad_norm as f32));
        AdamConfig::new().with_grad_clipping(clipping)
    }

    /// Sampling RNG for this configuration.
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    fn has_energy_terms(&self) -> bool {
        self.lambda_energy > 0.0 || self.lambda_energy_m > 0.0
    }

    fn has_diffusion_terms(&self) -> bool {
        self.diffusion_lambda_energy > 0.0 || self.diffusion_lambda_energy_m > 0.0
    }
}

/// Everything a training call reads but does not update.
pub struct TrainContext<'a, B: Backend> {
    pub sampler: &'a SnapshotSampler,
    /// Time groups in training order.
    pub groups: Vec<f64>,
    pub criterion: &'a dyn Criterion<B>,
    pub autoencoder: Option<&'a dyn Autoencoder<B>>,
    pub device: B::Device,
}

impl<'a, B: Backend> TrainContext<'a, B> {
    /// Context over every group of the sampler, without an autoencoder.
    pub fn new(sampler: &'a SnapshotSampler, criterion: &'a dyn Criterion<B>, device: B::Device) -> Self {
        Self {
            sampler,
            groups: sampler.groups().to_vec(),
            criterion,
            autoencoder: None,
            device,
        }
    }

    pub fn with_autoencoder(mut self, autoencoder: &'a dyn Autoencoder<B>) -> Self {
        self.autoencoder = Some(autoencoder);
        self
    }

    pub fn with_groups(mut self, groups: Vec<f64>) -> Self {
        self.groups = groups;
        self
    }
}

/// Groups minus a fixed hold-out.
pub(crate) fn groups_without(groups: &[f64], hold_out: Option<f64>) -> Vec<f64> {
    groups.iter().copied().filter(|&g| Some(g) != hold_out).collect()
}

fn check_finite<B: Backend>(loss: &Tensor<B, 1>, batch: usize) -> Result<f64, TrainError> {
    let value = tensor_to_f64(loss.clone());
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TrainError::NonFiniteLoss { batch, value })
    }
}

/// Per-call state shared by the local and global batch routines.
struct BatchRunner<'c, 'a, B: Backend> {
    config: &'c TrainConfig,
    ctx: &'c TrainContext<'a, B>,
    m_init: Option<f64>,
}

impl<B: AutodiffBackend> BatchRunner<'_, '_, B> {
    fn zeros(&self) -> Tensor<B, 1> {
        Tensor::zeros([1], &self.ctx.device)
    }

    /// Draw a mini-batch of `group`, with noise and GAE encoding applied.
    fn draw(&self, group: f64, rng: &mut impl Rng) -> Result<Tensor<B, 2>, TrainError> {
        let cfg = self.config;
        let x = self
            .ctx
            .sampler
            .sample::<B>(group, cfg.sample_size, cfg.sample_with_replacement, rng, &self.ctx.device)
            .map_err(TrainError::Sampling)?;
        let x = if cfg.add_noise {
            let [n, dim] = x.dims();
            let noise = noise_tensor(n, dim, cfg.use_gaussian, rng, &self.ctx.device);
            x + noise * cfg.noise_scale
        } else {
            x
        };
        Ok(match (cfg.use_gae, self.ctx.autoencoder) {
            (true, Some(ae)) => ae.encode(x),
            _ => x,
        })
    }

    fn embed(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        match (self.config.use_emb, self.ctx.autoencoder) {
            (true, Some(ae)) => ae.encode(x),
            _ => x,
        }
    }

    /// Criterion between prediction and target, thresholded and mass-weighted
    /// for growth-rate models.
    fn match_loss(&self, x: Tensor<B, 2>, target: Tensor<B, 2>, m: Option<Tensor<B, 1>>) -> Tensor<B, 1> {
        match m {
            Some(m) => {
                let (m, x) = subset_threshold(m, x, self.config.threshold_factor);
                self.ctx.criterion.weighted_loss(x, target, m)
            }
            None => self.ctx.criterion.loss(x, target),
        }
    }

    fn density(&self, x: Tensor<B, 2>, target: Tensor<B, 2>, m: Option<Tensor<B, 1>>) -> Tensor<B, 1> {
        let cfg = self.config;
        match m {
            Some(m) => {
                let m = if cfg.density_detach_m { m.detach() } else { m };
                let (m, x) = subset_threshold(m, x, cfg.threshold_factor);
                density_loss(x, target, cfg.top_k, cfg.hinge_value, Some(m))
            }
            None => density_loss(x, target, cfg.top_k, cfg.hinge_value, None),
        }
    }

    /// Drift and diffusion energy over `(positions, time)` pairs.
    fn energy_terms<M: TrajectoryModel<B>>(
        &self,
        model: &M,
        xs: &[Tensor<B, 2>],
        ms: Option<&[Tensor<B, 1>]>,
        times: &[f64],
    ) -> Tensor<B, 1> {
        let cfg = self.config;
        let device = &self.ctx.device;
        let mut loss = self.zeros();

        match ms {
            Some(ms) if cfg.has_energy_terms() => {
                let terms = xs
                    .iter()
                    .zip(ms)
                    .zip(times)
                    .map(|((x, m), &t)| (model.drift(x.clone(), t), m.clone()))
                    .collect();
                let (e, em) = growth_energy_loss_seq(terms, cfg.energy_weighted, cfg.energy_detach_m, device);
                loss = loss + e * cfg.lambda_energy + em * cfg.lambda_energy_m;
            }
            _ if cfg.lambda_energy > 0.0 => {
                loss = loss + energy_loss_seq(model, xs, times, device) * cfg.lambda_energy;
            }
            _ => {}
        }

        if cfg.has_diffusion_terms() && !xs.is_empty() {
            let fields: Option<Vec<Drift<B>>> = xs
                .iter()
                .zip(times)
                .map(|(x, &t)| model.diffusion(x.clone(), t))
                .collect();
            match (fields, ms) {
                (Some(fields), Some(ms)) => {
                    let terms = fields.into_iter().zip(ms.iter().cloned()).collect();
                    let (e, em) = growth_energy_loss_seq(
                        terms,
                        cfg.diffusion_energy_weighted,
                        cfg.diffusion_energy_detach_m,
                        device,
                    );
                    loss = loss + e * cfg.diffusion_lambda_energy + em * cfg.diffusion_lambda_energy_m;
                }
                (Some(fields), None) => {
                    let count = fields.len() as f64;
                    let e = fields
                        .into_iter()
                        .map(|f| field_energy(f.velocity))
                        .fold(self.zeros(), |acc, e| acc + e);
                    loss = loss + e / count * cfg.diffusion_lambda_energy;
                }
                (None, _) => {}
            }
        }
        loss
    }

    fn mass_terms(&self, kept: &[Tensor<B, 1>], all: &[Tensor<B, 1>]) -> Tensor<B, 1> {
        let cfg = self.config;
        let mut loss = self.zeros();
        if let Some(m_init) = self.m_init {
            if cfg.lambda_m > 0.0 {
                loss = loss + mass_mean_loss(kept, m_init, &self.ctx.device) * cfg.lambda_m;
            }
            if cfg.lambda_m2 > 0.0 {
                loss = loss + mass_point_loss(all, m_init, &self.ctx.device) * cfg.lambda_m2;
            }
        }
        loss
    }

    /// Loss of predicting `x1` at `t1` from `x0` at `t0`.
    fn step_loss<M: TrajectoryModel<B>>(
        &self,
        model: &M,
        x0: Tensor<B, 2>,
        x1: Tensor<B, 2>,
        t0: f64,
        t1: f64,
    ) -> Tensor<B, 1> {
        let cfg = self.config;
        let pred = model
            .integrate(x0, &[t0, t1])
            .detached(cfg.detach_x, cfg.detach_m);
        let (xp, mp) = pred.at(1);
        let masses: Vec<Tensor<B, 1>> = mp.iter().cloned().collect();

        let xp_emb = self.embed(xp.clone());
        let target = self.embed(x1);

        let mut loss = self.match_loss(xp_emb.clone(), target.clone(), mp.clone()) * cfg.lambda_ot;
        if cfg.use_density_loss {
            loss = loss + self.density(xp_emb, target, mp.clone()) * cfg.lambda_density;
        }
        let ms = mp.is_some().then_some(masses.as_slice());
        loss = loss + self.energy_terms(model, &[xp], ms, &[t1]);
        loss + self.mass_terms(&masses, &masses)
    }

    fn local_batch<M, O>(
        &self,
        mut model: M,
        optimizer: &mut O,
        groups: &[f64],
        batch: usize,
        rng: &mut impl Rng,
        history: &mut LossHistory,
    ) -> Result<M, TrainError>
    where
        M: AutodiffModule<B> + TrajectoryModel<B>,
        O: Optimizer<M, B>,
    {
        let cfg = self.config;
        let ignored = match cfg.hold_out {
            Some(hold_out) => Some(hold_out.pick(groups, rng)?),
            None => None,
        };
        let steps = generate_steps(&groups_without(groups, ignored));

        let mut pending = Vec::new();
        let mut values = Vec::with_capacity(steps.len());
        for (t0, t1) in steps {
            let x0 = self.draw(t0, rng)?;
            let x1 = self.draw(t1, rng)?;
            let loss = self.step_loss(&model, x0, x1, t0, t1);
            let value = check_finite(&loss, batch)?;

            if cfg.apply_losses_in_time {
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optimizer.step(cfg.lr, model, grads);
            } else {
                pending.push(loss);
            }
            history.record_local(&step_key(t0, t1), value);
            values.push(value);
        }

        if !pending.is_empty() {
            let total = Tensor::cat(pending, 0).sum();
            let grads = GradientsParams::from_grads(total.backward(), &model);
            model = optimizer.step(cfg.lr, model, grads);
        }

        if !values.is_empty() {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            tracing::debug!(batch, loss = mean, steps = values.len(), "local batch");
            history.batch.push(mean);
        }
        Ok(model)
    }

    fn global_batch<M, O>(
        &self,
        model: M,
        optimizer: &mut O,
        groups: &[f64],
        batch: usize,
        rng: &mut impl Rng,
        history: &mut LossHistory,
    ) -> Result<M, TrainError>
    where
        M: AutodiffModule<B> + TrajectoryModel<B>,
        O: Optimizer<M, B>,
    {
        let cfg = self.config;
        let xs = groups
            .iter()
            .map(|&g| self.draw(g, rng))
            .collect::<Result<Vec<_>, _>>()?;
        let pred = model
            .integrate(xs[0].clone(), groups)
            .detached(cfg.detach_x, cfg.detach_m);

        let ignored = match cfg.hold_out {
            Some(hold_out) => Some(hold_out.pick(groups, rng)?),
            None => None,
        };
        let kept: Vec<usize> = (0..groups.len())
            .filter(|&i| Some(groups[i]) != ignored)
            .collect();

        let mut ot = self.zeros();
        let mut density = self.zeros();
        let mut n_matched = 0;
        for &i in kept.iter().filter(|&&i| i > 0) {
            n_matched += 1;
            let (xp, mp) = pred.at(i);
            let xp = self.embed(xp);
            let target = self.embed(xs[i].clone());
            ot = ot + self.match_loss(xp.clone(), target.clone(), mp.clone());
            if cfg.use_density_loss {
                density = density + self.density(xp, target, mp);
            }
        }
        // OT sums over time points, density averages over them.
        let mut loss = ot * cfg.lambda_ot;
        if cfg.use_density_loss && n_matched > 0 {
            loss = loss + density / n_matched as f64 * cfg.lambda_density;
        }

        let kept_x: Vec<Tensor<B, 2>> = kept.iter().map(|&i| pred.positions[i].clone()).collect();
        let kept_t: Vec<f64> = kept.iter().map(|&i| groups[i]).collect();
        let kept_m: Option<Vec<Tensor<B, 1>>> = pred
            .masses
            .as_ref()
            .map(|all| kept.iter().map(|&i| all[i].clone()).collect());
        loss = loss + self.energy_terms(&model, &kept_x, kept_m.as_deref(), &kept_t);
        if let (Some(kept_m), Some(all)) = (kept_m.as_ref(), pred.masses.as_ref()) {
            loss = loss + self.mass_terms(kept_m, all);
        }

        let value = check_finite(&loss, batch)?;
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let model = optimizer.step(cfg.lr, model, grads);

        tracing::debug!(batch, loss = value, ignored = ?ignored, "global batch");
        history.global.push(value);
        Ok(model)
    }
}

/// Run `config.n_batches` training batches.
///
/// In the local regime every batch walks the consecutive group pairs,
/// integrating each `t0 → t1` from fresh samples; in the global regime every
/// batch integrates the first group through all group times. The model is
/// consumed and returned updated together with the losses of this call.
///
/// # Errors
/// - [`TrainError::CombinedLossUnsupported`] / [`TrainError::NoLossSelected`]
///   for an invalid regime selection.
/// - [`TrainError::CriterionWithoutMass`] when a growth-rate model is paired
///   with a criterion that ignores mass.
/// - [`TrainError::UnknownHoldOut`] when a fixed hold-out is not a group.
/// - [`TrainError::NonFiniteLoss`] as soon as any loss is NaN or infinite.
pub fn train<B, M, O>(
    config: &TrainConfig,
    mut model: M,
    optimizer: &mut O,
    ctx: &TrainContext<'_, B>,
    rng: &mut impl Rng,
) -> Result<(M, LossHistory), TrainError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + TrajectoryModel<B>,
    O: Optimizer<M, B>,
{
    let mut config = config.clone();
    if ctx.autoencoder.is_none() && (config.use_emb || config.use_gae) {
        tracing::warn!("autoencoder is None but use_emb or use_gae is set; both will be disabled");
        config.use_emb = false;
        config.use_gae = false;
    }

    match (config.local_loss, config.global_loss) {
        (true, true) => return Err(TrainError::CombinedLossUnsupported),
        (false, false) => return Err(TrainError::NoLossSelected),
        _ => {}
    }

    let m_init = model.initial_mass();
    if m_init.is_some() && !ctx.criterion.supports_mass() {
        return Err(TrainError::CriterionWithoutMass(ctx.criterion.name().to_string()));
    }

    let mut groups = ctx.groups.clone();
    if groups.len() < 2 {
        return Err(TrainError::Sampling(anyhow::anyhow!(
            "training needs at least two groups, got {}",
            groups.len()
        )));
    }
    if config.reverse {
        groups.reverse();
    }

    let fixed_hold_out = config.hold_out.and_then(|h| h.fixed());
    if let Some(g) = fixed_hold_out {
        if !groups.contains(&g) {
            return Err(TrainError::UnknownHoldOut(g));
        }
    }

    let mut history = LossHistory::with_steps(&generate_steps(&groups_without(&groups, fixed_hold_out)));
    let runner = BatchRunner {
        config: &config,
        ctx,
        m_init,
    };

    for batch in 0..config.n_batches {
        model = if config.local_loss {
            runner.local_batch(model, optimizer, &groups, batch, rng, &mut history)?
        } else {
            runner.global_batch(model, optimizer, &groups, batch, rng, &mut history)?
        };
    }

    let train_loss = if config.global_loss {
        history.mean_global()
    } else {
        history.mean_batch()
    };
    if let Some(loss) = train_loss {
        tracing::info!(
            train_loss = loss,
            reverse = config.reverse,
            regime = if config.global_loss { "global" } else { "local" },
            "Train loss: {loss:.5}"
        );
    }

    Ok((model, history))
}
