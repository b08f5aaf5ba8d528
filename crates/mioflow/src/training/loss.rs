//! Loss terms for MIOFlow training.
//!
//! Distribution matching (MMD, entropic OT), the density hinge regularizer,
//! energy penalties on the learned fields and mass penalties for growth-rate
//! models. Everything is generic over `B: Backend` and returns `(1,)` tensors.

use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::model::bridge::{index_tensor, tensor_to_f64, tensor_to_vec};
use crate::model::ode::{Drift, TrajectoryModel};

/// A differentiable distance between a predicted and an observed population.
pub trait Criterion<B: Backend> {
    /// Short name, used in logs and errors.
    fn name(&self) -> &str;

    /// Distance between `source` `(n, d)` and `target` `(m, d)`.
    fn loss(&self, source: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1>;

    /// Distance with per-point source masses `(n,)`.
    ///
    /// Criteria that do not support mass ignore it.
    fn weighted_loss(
        &self,
        source: Tensor<B, 2>,
        target: Tensor<B, 2>,
        _source_mass: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        self.loss(source, target)
    }

    /// Whether `weighted_loss` uses the masses.
    fn supports_mass(&self) -> bool {
        false
    }
}

/// Squared Euclidean distances between the rows of `x` `(n, d)` and `y` `(m, d)`.
pub fn pairwise_sq_dist<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
    let x_sq = x.clone().powf_scalar(2.0).sum_dim(1); // (n, 1)
    let y_sq = y.clone().powf_scalar(2.0).sum_dim(1).transpose(); // (1, m)
    let cross = x.matmul(y.transpose()); // (n, m)
    (x_sq + y_sq - cross * 2.0).clamp_min(0.0)
}

/// Euclidean distances, with a small offset so the gradient stays finite at zero.
pub fn pairwise_dist<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
    pairwise_sq_dist(x, y).add_scalar(1e-12).sqrt()
}

/// Normalize masses to probability weights.
fn mass_to_weights<B: Backend>(mass: Tensor<B, 1>) -> Tensor<B, 1> {
    let mass = mass.clamp_min(1e-12);
    let total = mass.clone().sum();
    mass / total
}

fn uniform_weights<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 1> {
    Tensor::full([n], 1.0 / n as f64, device)
}

/// `aᵀ K b` for weight vectors `a` `(n,)`, `b` `(m,)` and kernel `K` `(n, m)`.
fn quadratic_form<B: Backend>(a: Tensor<B, 1>, k: Tensor<B, 2>, b: Tensor<B, 1>) -> Tensor<B, 1> {
    a.unsqueeze::<2>()
        .matmul(k)
        .matmul(b.unsqueeze_dim::<2>(1))
        .reshape([1])
}

/// Row/column-stable log-sum-exp along `dim`, keeping the reduced dimension.
fn logsumexp<B: Backend>(x: Tensor<B, 2>, dim: usize) -> Tensor<B, 2> {
    let max = x.clone().detach().max_dim(dim);
    (x - max.clone()).exp().sum_dim(dim).log() + max
}

// ---------------------------------------------------------------------------
// MMD
// ---------------------------------------------------------------------------

/// Maximum mean discrepancy with a multi-bandwidth Gaussian kernel.
///
/// The base bandwidth is the mean pairwise squared distance of the pooled
/// samples; `kernel_num` kernels are spread around it by factors of
/// `kernel_mul`.
#[derive(Config, Debug)]
pub struct MmdLoss {
    #[config(default = 2.0)]
    pub kernel_mul: f64,
    #[config(default = 5)]
    pub kernel_num: usize,
    /// Weight source points by their mass in `weighted_loss`.
    #[config(default = false)]
    pub weighted: bool,
}

impl MmdLoss {
    fn mmd<B: Backend>(
        &self,
        source: Tensor<B, 2>,
        target: Tensor<B, 2>,
        source_weights: Option<Tensor<B, 1>>,
    ) -> Tensor<B, 1> {
        let [n, _] = source.dims();
        let [m, _] = target.dims();
        let device = source.device();
        let total = n + m;

        let pooled = Tensor::cat(vec![source, target], 0);
        let l2 = pairwise_sq_dist(pooled.clone(), pooled);

        let pairs = (total * total).saturating_sub(total).max(1) as f64;
        let base = tensor_to_f64(l2.clone().detach().sum()) / pairs;
        let base = base.max(1e-12) / self.kernel_mul.powi((self.kernel_num / 2) as i32);

        let mut kernel = Tensor::<B, 2>::zeros([total, total], &device);
        for i in 0..self.kernel_num {
            let bandwidth = base * self.kernel_mul.powi(i as i32);
            kernel = kernel + (l2.clone() / bandwidth).neg().exp();
        }

        let kxx = kernel.clone().slice([0..n, 0..n]);
        let kyy = kernel.clone().slice([n..total, n..total]);
        let kxy = kernel.slice([0..n, n..total]);

        let a = source_weights.unwrap_or_else(|| uniform_weights(n, &device));
        let b = uniform_weights::<B>(m, &device);
        quadratic_form(a.clone(), kxx, a.clone()) + quadratic_form(b.clone(), kyy, b.clone())
            - quadratic_form(a, kxy, b) * 2.0
    }
}

impl<B: Backend> Criterion<B> for MmdLoss {
    fn name(&self) -> &str {
        "mmd"
    }

    fn loss(&self, source: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        self.mmd(source, target, None)
    }

    fn weighted_loss(
        &self,
        source: Tensor<B, 2>,
        target: Tensor<B, 2>,
        source_mass: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        let weights = self.weighted.then(|| mass_to_weights(source_mass));
        self.mmd(source, target, weights)
    }

    fn supports_mass(&self) -> bool {
        self.weighted
    }
}

// ---------------------------------------------------------------------------
// Entropic OT
// ---------------------------------------------------------------------------

/// Entropy-regularized optimal transport (log-domain Sinkhorn).
///
/// Returns the transport cost `Σ P_ij C_ij` of the entropic plan under squared
/// Euclidean cost. Source marginals are proportional to the mass when given,
/// uniform otherwise; target marginals are uniform.
#[derive(Config, Debug)]
pub struct SinkhornLoss {
    /// Entropic regularization, relative to the largest cost when
    /// `normalize_cost` is set.
    #[config(default = 0.05)]
    pub epsilon: f64,
    #[config(default = 100)]
    pub n_iters: usize,
    /// Compute the plan on the cost matrix divided by its maximum.
    #[config(default = true)]
    pub normalize_cost: bool,
}

impl SinkhornLoss {
    fn transport_cost<B: Backend>(
        &self,
        source: Tensor<B, 2>,
        target: Tensor<B, 2>,
        source_weights: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        let [m, _] = target.dims();
        let device = source.device();
        let cost = pairwise_sq_dist(source, target);

        let plan_cost = if self.normalize_cost {
            let max = tensor_to_f64(cost.clone().detach().max());
            cost.clone() / max.max(1e-12)
        } else {
            cost.clone()
        };
        let eps = self.epsilon;

        let log_a = source_weights.log().unsqueeze_dim::<2>(1); // (n, 1)
        let log_b = uniform_weights::<B>(m, &device).log().unsqueeze::<2>(); // (1, m)

        let mut f = log_a.zeros_like();
        let mut g = log_b.zeros_like();
        for _ in 0..self.n_iters {
            f = logsumexp(log_b.clone() + (g.clone() - plan_cost.clone()) / eps, 1) * (-eps);
            g = logsumexp(log_a.clone() + (f.clone() - plan_cost.clone()) / eps, 0) * (-eps);
        }

        let log_plan = log_a + log_b + (f + g - plan_cost) / eps;
        (log_plan.exp() * cost).sum()
    }
}

impl<B: Backend> Criterion<B> for SinkhornLoss {
    fn name(&self) -> &str {
        "sinkhorn"
    }

    fn loss(&self, source: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, _] = source.dims();
        let weights = uniform_weights(n, &source.device());
        self.transport_cost(source, target, weights)
    }

    fn weighted_loss(
        &self,
        source: Tensor<B, 2>,
        target: Tensor<B, 2>,
        source_mass: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        self.transport_cost(source, target, mass_to_weights(source_mass))
    }

    fn supports_mass(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Regularizers
// ---------------------------------------------------------------------------

/// Keep the points whose mass exceeds `factor · mean(m)`.
///
/// `None` keeps everything; so does a threshold no point survives.
pub fn subset_threshold<B: Backend>(
    m: Tensor<B, 1>,
    x: Tensor<B, 2>,
    factor: Option<f64>,
) -> (Tensor<B, 1>, Tensor<B, 2>) {
    let Some(factor) = factor else {
        return (m, x);
    };
    let values = tensor_to_vec(m.clone().detach());
    if values.is_empty() {
        return (m, x);
    }
    let threshold = factor * values.iter().sum::<f64>() / values.len() as f64;
    let keep: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > threshold)
        .map(|(i, _)| i)
        .collect();
    if keep.is_empty() || keep.len() == values.len() {
        return (m, x);
    }
    let idx = index_tensor::<B>(&keep, &m.device());
    (m.select(0, idx.clone()), x.select(0, idx))
}

/// Density hinge loss.
///
/// For every source point, the distances to its `top_k` nearest targets,
/// minus `hinge` and clamped at zero, are averaged. With `weights`, each
/// source row is weighted by `softmax(weights)` instead of uniformly.
pub fn density_loss<B: Backend>(
    source: Tensor<B, 2>,
    target: Tensor<B, 2>,
    top_k: usize,
    hinge: f64,
    weights: Option<Tensor<B, 1>>,
) -> Tensor<B, 1> {
    let [n, _] = source.dims();
    let [m, _] = target.dims();
    let k = top_k.clamp(1, m);

    let dist = pairwise_dist(source, target);
    let (_, order) = dist.clone().detach().sort_with_indices(1);
    let nearest = dist.gather(1, order.slice([0..n, 0..k]));
    let hinged = nearest.sub_scalar(hinge).clamp_min(0.0);

    match weights {
        None => hinged.mean(),
        Some(w) => {
            let row_mean = hinged.mean_dim(1).squeeze::<1>(1);
            (row_mean * softmax(w, 0)).sum()
        }
    }
}

/// Mean squared norm of a velocity field `(n, d)`.
pub fn field_energy<B: Backend>(velocity: Tensor<B, 2>) -> Tensor<B, 1> {
    velocity.powf_scalar(2.0).sum_dim(1).mean()
}

/// Energy of the model's drift at `(x, t)`.
pub fn energy_loss<B: Backend, M: TrajectoryModel<B>>(model: &M, x: Tensor<B, 2>, t: f64) -> Tensor<B, 1> {
    field_energy(model.drift(x, t).velocity)
}

/// [`energy_loss`] averaged over a sequence of `(positions, time)` pairs.
pub fn energy_loss_seq<B: Backend, M: TrajectoryModel<B>>(
    model: &M,
    xs: &[Tensor<B, 2>],
    times: &[f64],
    device: &B::Device,
) -> Tensor<B, 1> {
    let count = xs.len().min(times.len());
    if count == 0 {
        return Tensor::zeros([1], device);
    }
    let total = xs
        .iter()
        .zip(times)
        .map(|(x, &t)| energy_loss(model, x.clone(), t))
        .reduce(|a, b| a + b)
        .unwrap_or_else(|| Tensor::zeros([1], device));
    total / count as f64
}

/// Energy of a growth-rate field.
///
/// Returns `(eloss, emloss)`: the (mass-weighted, unless `weighted` is off)
/// mean squared velocity, and the mean squared growth rate. `m` is detached
/// from the graph for the weighting when `detach_m` is set.
pub fn growth_energy_loss<B: Backend>(
    field: Drift<B>,
    m: Tensor<B, 1>,
    weighted: bool,
    detach_m: bool,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let device = m.device();
    let sq_norm = field.velocity.powf_scalar(2.0).sum_dim(1).squeeze::<1>(1);
    let eloss = if weighted {
        let m = if detach_m { m.detach() } else { m };
        (sq_norm * m).mean()
    } else {
        sq_norm.mean()
    };
    let emloss = match field.growth {
        Some(g) => g.powf_scalar(2.0).mean(),
        None => Tensor::zeros([1], &device),
    };
    (eloss, emloss)
}

/// [`growth_energy_loss`] averaged over a sequence of `(field, mass)` pairs.
pub fn growth_energy_loss_seq<B: Backend>(
    terms: Vec<(Drift<B>, Tensor<B, 1>)>,
    weighted: bool,
    detach_m: bool,
    device: &B::Device,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let count = terms.len();
    if count == 0 {
        return (Tensor::zeros([1], device), Tensor::zeros([1], device));
    }
    let mut eloss = Tensor::zeros([1], device);
    let mut emloss = Tensor::zeros([1], device);
    for (field, m) in terms {
        let (e, em) = growth_energy_loss(field, m, weighted, detach_m);
        eloss = eloss + e;
        emloss = emloss + em;
    }
    (eloss / count as f64, emloss / count as f64)
}

/// `mean_t (mean_n m_t − m_init)²`: keeps the average mass of each time
/// point near its initial value while letting single points grow or shrink.
pub fn mass_mean_loss<B: Backend>(masses: &[Tensor<B, 1>], m_init: f64, device: &B::Device) -> Tensor<B, 1> {
    if masses.is_empty() {
        return Tensor::zeros([1], device);
    }
    let means: Vec<Tensor<B, 1>> = masses.iter().map(|m| m.clone().mean()).collect();
    Tensor::cat(means, 0).sub_scalar(m_init).powf_scalar(2.0).mean()
}

/// `mean (m − m_init)²` over every point of every time.
pub fn mass_point_loss<B: Backend>(masses: &[Tensor<B, 1>], m_init: f64, device: &B::Device) -> Tensor<B, 1> {
    if masses.is_empty() {
        return Tensor::zeros([1], device);
    }
    Tensor::cat(masses.to_vec(), 0)
        .sub_scalar(m_init)
        .powf_scalar(2.0)
        .mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ode::OdeModelConfig;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar().elem()
    }

    fn line(n: usize, offset: f32) -> Tensor<TestBackend, 2> {
        let device = Default::default();
        let flat: Vec<f32> = (0..n)
            .flat_map(|i| [i as f32 * 0.5 / n as f32 + offset, 0.0])
            .collect();
        Tensor::from_data(TensorData::new(flat, [n, 2]), &device)
    }

    #[test]
    fn test_pairwise_sq_dist() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.0_f32, 0.0], [3.0, 4.0]]), &device);
        let y = Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.0_f32, 0.0]]), &device);
        let d: Vec<f32> = pairwise_sq_dist(x, y).into_data().to_vec().unwrap();
        assert!((d[0] - 0.0).abs() < 1e-5);
        assert!((d[1] - 25.0).abs() < 1e-4);
    }

    #[test]
    fn test_mmd_identical_is_zero() {
        let x = line(20, 0.0);
        let loss = scalar(MmdLoss::new().loss(x.clone(), x));
        assert!(loss.abs() < 1e-4, "MMD of identical sets should be ~0, got {loss}");
    }

    #[test]
    fn test_mmd_grows_with_shift() {
        let crit = MmdLoss::new();
        let near = scalar(crit.loss(line(20, 0.0), line(20, 0.1)));
        let far = scalar(crit.loss(line(20, 0.0), line(20, 2.0)));
        assert!(far > near, "far={far} should exceed near={near}");
        assert!(near >= -1e-5);
    }

    #[test]
    fn test_mmd_unequal_sizes() {
        let loss = scalar(MmdLoss::new().loss(line(7, 0.0), line(15, 0.0)));
        assert!(loss.is_finite());
    }

    #[test]
    fn test_mmd_mass_support_flag() {
        assert!(!Criterion::<TestBackend>::supports_mass(&MmdLoss::new()));
        assert!(Criterion::<TestBackend>::supports_mass(&MmdLoss::new().with_weighted(true)));
    }

    #[test]
    fn test_sinkhorn_translation_cost() {
        // Under a pure translation by 3, every coupling with uniform marginals
        // costs at least 9; the entropic blur adds at most the squared spread.
        let loss = scalar(SinkhornLoss::new().loss(line(10, 0.0), line(10, 3.0)));
        assert!(loss > 8.99 && loss < 9.3, "unexpected translation cost {loss}");
    }

    #[test]
    fn test_sinkhorn_mass_changes_cost() {
        let device = Default::default();
        let crit = SinkhornLoss::new();
        let source = line(10, 0.0);
        let target = line(10, 1.0);
        let uniform = scalar(crit.loss(source.clone(), target.clone()));

        let mut mass = vec![0.01_f32; 10];
        mass[9] = 10.0;
        let mass = Tensor::<TestBackend, 1>::from_data(TensorData::new(mass, [10]), &device);
        let weighted = scalar(crit.weighted_loss(source, target, mass));
        assert!((uniform - weighted).abs() > 1e-3, "mass should change the transport cost");
    }

    #[test]
    fn test_subset_threshold() {
        let device = Default::default();
        let m = Tensor::<TestBackend, 1>::from_data(TensorData::from([1.0_f32, 0.01, 1.0, 1.0]), &device);
        let x = line(4, 0.0);

        let (m_kept, x_kept) = subset_threshold(m.clone(), x.clone(), Some(0.1));
        assert_eq!(m_kept.dims(), [3]);
        assert_eq!(x_kept.dims(), [3, 2]);

        let (m_all, _) = subset_threshold(m.clone(), x.clone(), None);
        assert_eq!(m_all.dims(), [4]);

        // Nothing exceeds twice the mean of equal masses: keep everything.
        let equal = Tensor::<TestBackend, 1>::ones([4], &device);
        let (m_all, x_all) = subset_threshold(equal, x, Some(2.0));
        assert_eq!(m_all.dims(), [4]);
        assert_eq!(x_all.dims(), [4, 2]);
    }

    #[test]
    fn test_density_loss_zero_on_target() {
        let x = line(10, 0.0);
        let loss = scalar(density_loss(x.clone(), x, 1, 0.01, None));
        assert!(loss.abs() < 1e-6, "points on the target should cost nothing, got {loss}");
    }

    #[test]
    fn test_density_loss_far_source() {
        let device = Default::default();
        let source = Tensor::<TestBackend, 2>::from_data(TensorData::from([[10.0_f32, 0.0]]), &device);
        let target = Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.0_f32, 0.0], [1.0, 0.0]]), &device);
        // Nearest two distances are 9 and 10; minus hinge 1, mean = 8.5.
        let loss = scalar(density_loss(source.clone(), target.clone(), 2, 1.0, None));
        assert!((loss - 8.5).abs() < 1e-4, "got {loss}");
        // top_k larger than the target set is clamped.
        let loss = scalar(density_loss(source, target, 10, 1.0, None));
        assert!((loss - 8.5).abs() < 1e-4, "got {loss}");
    }

    #[test]
    fn test_density_loss_weighted() {
        let device = Default::default();
        let source = Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.0_f32, 0.0], [5.0, 0.0]]), &device);
        let target = Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.0_f32, 0.0]]), &device);
        let heavy_near = Tensor::<TestBackend, 1>::from_data(TensorData::from([10.0_f32, 0.0]), &device);
        let heavy_far = Tensor::<TestBackend, 1>::from_data(TensorData::from([0.0_f32, 10.0]), &device);
        let near = scalar(density_loss(source.clone(), target.clone(), 1, 0.0, Some(heavy_near)));
        let far = scalar(density_loss(source, target, 1, 0.0, Some(heavy_far)));
        assert!(far > near, "weighting the far point should cost more: {far} vs {near}");
        assert!(far < 5.0 + 1e-4);
    }

    #[test]
    fn test_growth_energy_loss() {
        let device = Default::default();
        let velocity = Tensor::<TestBackend, 2>::from_data(TensorData::from([[1.0_f32, 0.0], [0.0, 2.0]]), &device);
        let growth = Tensor::<TestBackend, 1>::from_data(TensorData::from([3.0_f32, 1.0]), &device);
        let m = Tensor::<TestBackend, 1>::from_data(TensorData::from([2.0_f32, 1.0]), &device);
        let field = Drift { velocity, growth: Some(growth) };

        let (e, em) = growth_energy_loss(field.clone(), m.clone(), true, false);
        // (1·2 + 4·1) / 2 = 3; (9 + 1) / 2 = 5.
        assert!((scalar(e) - 3.0).abs() < 1e-5);
        assert!((scalar(em) - 5.0).abs() < 1e-5);

        let (e, _) = growth_energy_loss(field, m, false, false);
        assert!((scalar(e) - 2.5).abs() < 1e-5);
    }

    #[test]
    fn test_mass_losses() {
        let device = Default::default();
        let m0 = Tensor::<TestBackend, 1>::from_data(TensorData::from([1.0_f32, 1.0]), &device);
        let m1 = Tensor::<TestBackend, 1>::from_data(TensorData::from([0.0_f32, 4.0]), &device);
        let masses = vec![m0, m1];

        // Means are 1 and 2: ((0)² + (1)²) / 2 = 0.5.
        let mean_loss = scalar(mass_mean_loss(&masses, 1.0, &device));
        assert!((mean_loss - 0.5).abs() < 1e-5);
        // Points: 0, 0, 1, 9 → mean 2.5.
        let point_loss = scalar(mass_point_loss(&masses, 1.0, &device));
        assert!((point_loss - 2.5).abs() < 1e-5);
    }

    #[test]
    fn test_energy_loss_seq_matches_single() {
        let device = Default::default();
        let model = OdeModelConfig::new(2).with_hidden(vec![8]).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 2>::random([5, 2], Distribution::Normal(0.0, 1.0), &device);
        let single = scalar(energy_loss(&model, x.clone(), 1.0));
        let seq = scalar(energy_loss_seq(&model, &[x.clone(), x], &[1.0, 1.0], &device));
        assert!((single - seq).abs() < 1e-5);
    }

    #[test]
    fn test_criteria_backpropagate() {
        let device = Default::default();
        let source = Tensor::<TestAutodiffBackend, 2>::random([8, 2], Distribution::Normal(0.0, 1.0), &device)
            .require_grad();
        let target = Tensor::<TestAutodiffBackend, 2>::random([8, 2], Distribution::Normal(1.0, 1.0), &device);

        let loss = MmdLoss::new().loss(source.clone(), target.clone())
            + SinkhornLoss::new().with_n_iters(10).loss(source.clone(), target.clone())
            + density_loss(source.clone(), target, 3, 0.01, None);
        let grads = loss.backward();
        let grad = source.grad(&grads).expect("source should receive a gradient");
        let norm: f32 = grad.abs().sum().into_scalar().elem();
        assert!(norm > 0.0 && norm.is_finite());
    }
}
