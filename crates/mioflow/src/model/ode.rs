//! Neural ODE/SDE trajectory models.
//!
//! The trainer only talks to models through [`TrajectoryModel`]: integrate a
//! population forward through a list of times, and evaluate the drift (and
//! diffusion) fields for energy penalties. [`OdeModel`] is the reference
//! implementation: an MLP vector field over `[x, t]` integrated with a
//! fixed-step solver, optionally with a growth-rate head (per-point mass) and a
//! learned diffusion term.

use burn::module::Ignored;
use burn::prelude::*;
use burn::tensor::Distribution;
use serde::{Deserialize, Serialize};

use crate::model::mlp::{Activation, Mlp, MlpConfig};

/// Velocity (and growth rate, for growth-rate models) of a field at a set of points.
#[derive(Debug, Clone)]
pub struct Drift<B: Backend> {
    /// `(n, d)` velocity.
    pub velocity: Tensor<B, 2>,
    /// `(n,)` per-point log-mass rate. `None` for position-only models.
    pub growth: Option<Tensor<B, 1>>,
}

/// Integrated population at each requested time.
#[derive(Debug, Clone)]
pub struct Prediction<B: Backend> {
    /// One `(n, d)` tensor per requested time; `positions[0]` is the input.
    pub positions: Vec<Tensor<B, 2>>,
    /// One `(n,)` mass tensor per requested time, for growth-rate models.
    pub masses: Option<Vec<Tensor<B, 1>>>,
}

impl<B: Backend> Prediction<B> {
    /// Number of time points.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Positions and mass at time index `i`.
    pub fn at(&self, i: usize) -> (Tensor<B, 2>, Option<Tensor<B, 1>>) {
        let mass = self.masses.as_ref().map(|m| m[i].clone());
        (self.positions[i].clone(), mass)
    }

    /// Detach positions and/or masses from the autodiff graph.
    pub fn detached(self, detach_x: bool, detach_m: bool) -> Self {
        let positions = if detach_x {
            self.positions.into_iter().map(|x| x.detach()).collect()
        } else {
            self.positions
        };
        let masses = match (self.masses, detach_m) {
            (Some(m), true) => Some(m.into_iter().map(|m| m.detach()).collect()),
            (m, _) => m,
        };
        Self { positions, masses }
    }
}

/// A continuous-time population model that can be trained on snapshots.
pub trait TrajectoryModel<B: Backend> {
    /// Integrate `x0` (observed at `times[0]`) through every time in `times`.
    ///
    /// Times may decrease, in which case the model is integrated backwards.
    fn integrate(&self, x0: Tensor<B, 2>, times: &[f64]) -> Prediction<B>;

    /// Evaluate the drift field at `(x, t)`.
    fn drift(&self, x: Tensor<B, 2>, t: f64) -> Drift<B>;

    /// Evaluate the diffusion field at `(x, t)`. `None` for deterministic models.
    fn diffusion(&self, _x: Tensor<B, 2>, _t: f64) -> Option<Drift<B>> {
        None
    }

    /// Initial per-point mass. `Some` exactly for growth-rate models.
    fn initial_mass(&self) -> Option<f64> {
        None
    }
}

/// Fixed-step integration scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Solver {
    Euler,
    Rk4,
}

/// Configuration for [`OdeModel`].
#[derive(Config, Debug)]
pub struct OdeModelConfig {
    /// Dimension of the state space.
    pub dim: usize,
    /// Hidden layer widths of the drift (and diffusion) networks.
    #[config(default = "vec![64, 64, 64]")]
    pub hidden: Vec<usize>,
    #[config(default = "Activation::LeakyRelu")]
    pub activation: Activation,
    /// Add a growth-rate head so every point carries a mass.
    #[config(default = false)]
    pub growth_rate: bool,
    /// Add a learned diffusion network (Euler–Maruyama integration).
    #[config(default = false)]
    pub stochastic: bool,
    /// Mass every point starts with.
    #[config(default = 1.0)]
    pub m_init: f64,
    #[config(default = "Solver::Rk4")]
    pub solver: Solver,
    /// Solver steps between two consecutive requested times.
    #[config(default = 4)]
    pub n_substeps: usize,
    /// Multiplier on the diffusion noise.
    #[config(default = 0.1)]
    pub diffusion_scale: f64,
}

/// MLP vector field over `[x, t]` with optional growth and diffusion.
#[derive(Module, Debug)]
pub struct OdeModel<B: Backend> {
    drift_net: Mlp<B>,
    diffusion_net: Option<Mlp<B>>,
    dim: usize,
    growth_rate: bool,
    m_init: f64,
    solver: Ignored<Solver>,
    n_substeps: usize,
    diffusion_scale: f64,
}

impl OdeModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> OdeModel<B> {
        let d_output = self.dim + usize::from(self.growth_rate);
        let net = || {
            MlpConfig::new(self.dim + 1, d_output)
                .with_hidden(self.hidden.clone())
                .with_activation(self.activation)
                .init(device)
        };
        OdeModel {
            drift_net: net(),
            diffusion_net: self.stochastic.then(net),
            dim: self.dim,
            growth_rate: self.growth_rate,
            m_init: self.m_init,
            solver: Ignored(self.solver),
            n_substeps: self.n_substeps.max(1),
            diffusion_scale: self.diffusion_scale,
        }
    }
}

fn axpy<B: Backend>(
    m: &Option<Tensor<B, 1>>,
    dm: &Option<Tensor<B, 1>>,
    h: f64,
) -> Option<Tensor<B, 1>> {
    match (m, dm) {
        (Some(m), Some(dm)) => Some(m.clone() + dm.clone() * h),
        (m, _) => m.clone(),
    }
}

impl<B: Backend> OdeModel<B> {
    pub fn is_stochastic(&self) -> bool {
        self.diffusion_net.is_some()
    }

    /// Append the time column and run `net`, then split off the growth column.
    fn eval_field(&self, net: &Mlp<B>, x: Tensor<B, 2>, t: f64) -> Drift<B> {
        let [n, _] = x.dims();
        let time = Tensor::full([n, 1], t, &x.device());
        let out = net.forward(Tensor::cat(vec![x, time], 1));
        let velocity = out.clone().slice([0..n, 0..self.dim]);
        let growth = self
            .growth_rate
            .then(|| out.slice([0..n, self.dim..self.dim + 1]).squeeze::<1>(1));
        Drift { velocity, growth }
    }

    /// Time derivative of the augmented state. Mass follows `dm/dt = g(x, t) m`.
    fn derivative(
        &self,
        x: Tensor<B, 2>,
        m: &Option<Tensor<B, 1>>,
        t: f64,
    ) -> (Tensor<B, 2>, Option<Tensor<B, 1>>) {
        let Drift { velocity, growth } = self.drift(x, t);
        let dm = match (growth, m) {
            (Some(g), Some(m)) => Some(g * m.clone()),
            _ => None,
        };
        (velocity, dm)
    }

    fn solver_step(
        &self,
        x: Tensor<B, 2>,
        m: Option<Tensor<B, 1>>,
        t: f64,
        h: f64,
    ) -> (Tensor<B, 2>, Option<Tensor<B, 1>>) {
        match self.solver.0 {
            Solver::Euler => {
                let (dx, dm) = self.derivative(x.clone(), &m, t);
                (x + dx * h, axpy(&m, &dm, h))
            }
            Solver::Rk4 => {
                let half = h / 2.0;
                let (k1x, k1m) = self.derivative(x.clone(), &m, t);
                let (k2x, k2m) =
                    self.derivative(x.clone() + k1x.clone() * half, &axpy(&m, &k1m, half), t + half);
                let (k3x, k3m) =
                    self.derivative(x.clone() + k2x.clone() * half, &axpy(&m, &k2m, half), t + half);
                let (k4x, k4m) = self.derivative(x.clone() + k3x.clone() * h, &axpy(&m, &k3m, h), t + h);

                let x_next = x + (k1x + k2x * 2.0 + k3x * 2.0 + k4x) * (h / 6.0);
                let dm = match (k1m, k2m, k3m, k4m) {
                    (Some(a), Some(b), Some(c), Some(d)) => Some(a + b * 2.0 + c * 2.0 + d),
                    _ => None,
                };
                (x_next, axpy(&m, &dm, h / 6.0))
            }
        }
    }

    /// Euler–Maruyama noise increment for one step of size `h`.
    fn diffusion_step(
        &self,
        x: Tensor<B, 2>,
        m: Option<Tensor<B, 1>>,
        t_before: f64,
        x_before: Tensor<B, 2>,
        h: f64,
    ) -> (Tensor<B, 2>, Option<Tensor<B, 1>>) {
        let Some(sigma) = self.diffusion(x_before, t_before) else {
            return (x, m);
        };
        let [n, d] = x.dims();
        let device = x.device();
        let scale = self.diffusion_scale * h.abs().sqrt();

        let noise = Tensor::random([n, d], Distribution::Normal(0.0, 1.0), &device);
        let x = x + sigma.velocity * noise * scale;
        let m = match (m, sigma.growth) {
            (Some(m), Some(g)) => {
                let noise = Tensor::random([n], Distribution::Normal(0.0, 1.0), &device);
                Some(m.clone() + g * m * noise * scale)
            }
            (m, _) => m,
        };
        (x, m)
    }
}

impl<B: Backend> TrajectoryModel<B> for OdeModel<B> {
    fn integrate(&self, x0: Tensor<B, 2>, times: &[f64]) -> Prediction<B> {
        let [n, _] = x0.dims();
        let device = x0.device();

        let mut x = x0.clone();
        let mut m = self
            .growth_rate
            .then(|| Tensor::<B, 1>::full([n], self.m_init, &device));

        let mut positions = Vec::with_capacity(times.len());
        let mut masses = m.as_ref().map(|m| {
            let mut v = Vec::with_capacity(times.len());
            v.push(m.clone());
            v
        });
        positions.push(x0);

        for w in times.windows(2) {
            let (t0, t1) = (w[0], w[1]);
            let h = (t1 - t0) / self.n_substeps as f64;
            for k in 0..self.n_substeps {
                let t = t0 + k as f64 * h;
                let x_before = x.clone();
                (x, m) = self.solver_step(x, m, t, h);
                if self.is_stochastic() {
                    (x, m) = self.diffusion_step(x, m, t, x_before, h);
                }
            }
            positions.push(x.clone());
            if let (Some(all), Some(m)) = (masses.as_mut(), m.as_ref()) {
                all.push(m.clone());
            }
        }

        Prediction { positions, masses }
    }

    fn drift(&self, x: Tensor<B, 2>, t: f64) -> Drift<B> {
        self.eval_field(&self.drift_net, x, t)
    }

    fn diffusion(&self, x: Tensor<B, 2>, t: f64) -> Option<Drift<B>> {
        self.diffusion_net
            .as_ref()
            .map(|net| self.eval_field(net, x, t))
    }

    fn initial_mass(&self) -> Option<f64> {
        self.growth_rate.then_some(self.m_init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::optim::GradientsParams;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn small(dim: usize) -> OdeModelConfig {
        OdeModelConfig::new(dim).with_hidden(vec![16, 16])
    }

    #[test]
    fn test_integrate_shapes() {
        let device = Default::default();
        let model = small(3).init::<TestBackend>(&device);
        let x0 = Tensor::<TestBackend, 2>::random([10, 3], Distribution::Normal(0.0, 1.0), &device);

        let pred = model.integrate(x0, &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(pred.len(), 4);
        assert!(pred.masses.is_none());
        for x in &pred.positions {
            assert_eq!(x.dims(), [10, 3]);
        }
        assert!(model.initial_mass().is_none());
    }

    #[test]
    fn test_first_position_is_input() {
        let device = Default::default();
        let model = small(2).init::<TestBackend>(&device);
        let x0 = Tensor::<TestBackend, 2>::random([5, 2], Distribution::Normal(0.0, 1.0), &device);

        let pred = model.integrate(x0.clone(), &[1.0, 2.0]);
        let diff: f32 = (pred.positions[0].clone() - x0).abs().sum().into_scalar().elem();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_growth_rate_masses() {
        let device = Default::default();
        let model = small(2)
            .with_growth_rate(true)
            .with_m_init(2.0)
            .init::<TestBackend>(&device);
        assert_eq!(model.initial_mass(), Some(2.0));

        let x0 = Tensor::<TestBackend, 2>::random([6, 2], Distribution::Normal(0.0, 1.0), &device);
        let pred = model.integrate(x0.clone(), &[0.0, 0.5, 1.0]);
        let masses = pred.masses.as_ref().expect("growth model returns masses");
        assert_eq!(masses.len(), 3);
        let m0: Vec<f32> = masses[0].clone().into_data().to_vec().unwrap();
        assert!(m0.iter().all(|&m| (m - 2.0).abs() < 1e-6));

        let drift = model.drift(x0, 0.0);
        assert_eq!(drift.velocity.dims(), [6, 2]);
        assert_eq!(drift.growth.expect("growth head").dims(), [6]);
    }

    #[test]
    fn test_zero_interval_is_identity() {
        let device = Default::default();
        let model = small(2).with_solver(Solver::Euler).init::<TestBackend>(&device);
        let x0 = Tensor::<TestBackend, 2>::random([4, 2], Distribution::Normal(0.0, 1.0), &device);
        let pred = model.integrate(x0.clone(), &[1.0, 1.0]);
        let diff: f32 = (pred.positions[1].clone() - x0).abs().sum().into_scalar().elem();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_reverse_integration_undoes_forward() {
        // For a smooth field and small step, integrating forward then backward
        // returns close to the start.
        let device = Default::default();
        let model = small(2)
            .with_solver(Solver::Rk4)
            .with_n_substeps(20)
            .init::<TestBackend>(&device);
        let x0 = Tensor::<TestBackend, 2>::random([4, 2], Distribution::Normal(0.0, 1.0), &device);

        let forward = model.integrate(x0.clone(), &[0.0, 0.2]);
        let back = model.integrate(forward.positions[1].clone(), &[0.2, 0.0]);
        let err: f32 = (back.positions[1].clone() - x0).abs().max().into_scalar().elem();
        assert!(err < 1e-3, "round-trip error {err}");
    }

    #[test]
    fn test_stochastic_model_has_diffusion() {
        let device = Default::default();
        let model = small(2)
            .with_stochastic(true)
            .with_growth_rate(true)
            .init::<TestBackend>(&device);
        assert!(model.is_stochastic());
        let x = Tensor::<TestBackend, 2>::random([3, 2], Distribution::Normal(0.0, 1.0), &device);
        let sigma = model.diffusion(x.clone(), 0.5).expect("diffusion");
        assert_eq!(sigma.velocity.dims(), [3, 2]);
        let pred = model.integrate(x, &[0.0, 1.0]);
        assert_eq!(pred.positions[1].dims(), [3, 2]);
    }

    #[test]
    fn test_gradient_flows_through_integration() {
        let device = Default::default();
        let model = small(2).init::<TestAutodiffBackend>(&device);
        let x0 = Tensor::<TestAutodiffBackend, 2>::random([8, 2], Distribution::Normal(0.0, 1.0), &device);

        let pred = model.integrate(x0, &[0.0, 1.0]);
        let loss = pred.positions[1].clone().powf_scalar(2.0).mean();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        assert!(!grads.is_empty(), "integration should produce parameter gradients");
    }

    #[test]
    fn test_detached_prediction_keeps_shapes() {
        let device = Default::default();
        let model = small(2).with_growth_rate(true).init::<TestAutodiffBackend>(&device);
        let x0 = Tensor::<TestAutodiffBackend, 2>::random([4, 2], Distribution::Normal(0.0, 1.0), &device);
        let pred = model.integrate(x0, &[0.0, 1.0]).detached(true, true);
        let (x, m) = pred.at(1);
        assert_eq!(x.dims(), [4, 2]);
        assert_eq!(m.expect("mass").dims(), [4]);
    }

    /// Gradient norm reaching `x0` through the prediction at `t = 1`.
    fn input_grad_norm(detach_x: bool, detach_m: bool, through_mass: bool) -> f32 {
        let device = Default::default();
        let model = small(2)
            .with_growth_rate(true)
            .init::<TestAutodiffBackend>(&device);
        let x0 = Tensor::<TestAutodiffBackend, 2>::random([4, 2], Distribution::Normal(0.0, 1.0), &device)
            .require_grad();
        let pred = model.integrate(x0.clone(), &[0.0, 1.0]).detached(detach_x, detach_m);
        let (x, m) = pred.at(1);
        let term = if through_mass {
            m.expect("growth model returns masses").sum()
        } else {
            x.powf_scalar(2.0).sum()
        };
        // Keeps x0 in the graph when the prediction is detached.
        let loss = term + x0.clone().sum() * 0.0;
        let grads = loss.backward();
        let grad = x0.grad(&grads).expect("x0 is part of the graph");
        grad.abs().sum().into_scalar().elem()
    }

    #[test]
    fn test_detached_prediction_blocks_gradient() {
        assert!(input_grad_norm(false, false, false) > 0.0);
        assert_eq!(input_grad_norm(true, false, false), 0.0);
        assert!(input_grad_norm(true, false, true) > 0.0);
        assert_eq!(input_grad_norm(false, true, true), 0.0);
    }
}
