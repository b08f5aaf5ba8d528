//! Geodesic autoencoder pretraining.
//!
//! The encoder is trained so that squared latent distances match a distance
//! matrix computed on the data (typically geodesic distances on a k-NN
//! graph), optionally together with a reconstruction loss.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use burn::module::AutodiffModule;
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ordered_float::OrderedFloat;
use rand::Rng;

use crate::error::TrainError;
use crate::model::autoencoder::Autoencoder;
use crate::model::bridge::{noise_tensor, rows_to_tensor, tensor_to_f64, tensor_to_rows};
use crate::training::data::{HoldOut, SnapshotSampler};
use crate::training::loss::pairwise_sq_dist;

/// Pairwise distances on a point set.
pub trait DistanceFn {
    /// `n × n` distance matrix of `points`.
    fn fit(&self, points: &[Vec<f32>]) -> Vec<Vec<f32>>;
}

fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = f64::from(x) - f64::from(y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Straight-line distances.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanDistance;

impl DistanceFn for EuclideanDistance {
    fn fit(&self, points: &[Vec<f32>]) -> Vec<Vec<f32>> {
        points
            .iter()
            .map(|a| points.iter().map(|b| euclidean(a, b) as f32).collect())
            .collect()
    }
}

/// Shortest-path distances on the symmetric k-nearest-neighbour graph.
///
/// Pairs in different connected components get the largest finite distance.
#[derive(Debug, Clone, Copy)]
pub struct KnnGeodesicDistance {
    pub k: usize,
}

impl KnnGeodesicDistance {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    fn graph(&self, points: &[Vec<f32>]) -> Vec<Vec<(usize, f64)>> {
        let n = points.len();
        let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        for i in 0..n {
            let mut neighbours: Vec<(OrderedFloat<f64>, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (OrderedFloat(euclidean(&points[i], &points[j])), j))
                .collect();
            neighbours.sort_unstable();
            for &(OrderedFloat(d), j) in neighbours.iter().take(self.k) {
                adjacency[i].push((j, d));
                adjacency[j].push((i, d));
            }
        }
        adjacency
    }

    fn dijkstra(adjacency: &[Vec<(usize, f64)>], source: usize) -> Vec<f64> {
        let mut dist = vec![f64::INFINITY; adjacency.len()];
        let mut heap = BinaryHeap::new();
        dist[source] = 0.0;
        heap.push(Reverse((OrderedFloat(0.0), source)));

        while let Some(Reverse((OrderedFloat(d), u))) = heap.pop() {
            if d > dist[u] {
                continue;
            }
            for &(v, w) in &adjacency[u] {
                let next = d + w;
                if next < dist[v] {
                    dist[v] = next;
                    heap.push(Reverse((OrderedFloat(next), v)));
                }
            }
        }
        dist
    }
}

impl DistanceFn for KnnGeodesicDistance {
    fn fit(&self, points: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let adjacency = self.graph(points);
        let mut matrix: Vec<Vec<f64>> = (0..points.len())
            .map(|i| Self::dijkstra(&adjacency, i))
            .collect();

        let max_finite = matrix
            .iter()
            .flatten()
            .copied()
            .filter(|d| d.is_finite())
            .fold(0.0_f64, f64::max);
        for row in &mut matrix {
            for d in row.iter_mut() {
                if !d.is_finite() {
                    *d = max_finite;
                }
            }
        }
        matrix
            .into_iter()
            .map(|row| row.into_iter().map(|d| d as f32).collect())
            .collect()
    }
}

/// Configuration for [`train_ae`].
#[derive(Config, Debug)]
pub struct AutoencoderTrainingConfig {
    #[config(default = 60)]
    pub n_epochs: usize,
    /// Train the decoder with a reconstruction loss.
    #[config(default = true)]
    pub recon: bool,
    /// Points drawn from each group per epoch.
    #[config(default = 100)]
    pub sample_size: usize,
    #[config(default = false)]
    pub sample_with_replacement: bool,
    /// Input noise scale is drawn from `U(noise_min_scale, noise_max_scale)` every epoch.
    #[config(default = 0.09)]
    pub noise_min_scale: f64,
    #[config(default = 0.15)]
    pub noise_max_scale: f64,
    /// Group left out of training.
    pub hold_out: Option<HoldOut>,
    #[config(default = 1e-3)]
    pub lr: f64,
    /// Epochs between loss log lines.
    #[config(default = 50)]
    pub log_every: usize,
    /// Seed for sampling, hold-out picks and input noise.
    pub seed: Option<u64>,
}

impl AutoencoderTrainingConfig {
    pub fn optimizer_config(&self) -> AdamConfig {
        AdamConfig::new()
    }

    fn noise_scale(&self, rng: &mut impl Rng) -> f64 {
        if self.noise_max_scale > self.noise_min_scale {
            rng.gen_range(self.noise_min_scale..self.noise_max_scale)
        } else {
            self.noise_min_scale
        }
    }
}

/// Train a geodesic autoencoder.
///
/// Every epoch stacks samples of all (non-held-out) groups, perturbs them with
/// Gaussian noise of a random scale and encodes them. The loss is the
/// reconstruction MSE (when `recon`) plus, with a distance function, the MSE
/// between squared latent distances and the data's distance matrix.
///
/// Returns the trained model and the loss of every epoch.
///
/// # Errors
/// [`TrainError::NoLossSelected`] without `recon` and without `dist`;
/// [`TrainError::NonFiniteLoss`] on a NaN/infinite loss.
#[allow(clippy::too_many_arguments)]
pub fn train_ae<B, M, O>(
    config: &AutoencoderTrainingConfig,
    mut model: M,
    optimizer: &mut O,
    sampler: &SnapshotSampler,
    groups: &[f64],
    dist: Option<&dyn DistanceFn>,
    rng: &mut impl Rng,
    device: &B::Device,
) -> Result<(M, Vec<f64>), TrainError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Autoencoder<B>,
    O: Optimizer<M, B>,
{
    if !config.recon && dist.is_none() {
        return Err(TrainError::NoLossSelected);
    }

    let mse = MseLoss::new();
    let mut losses = Vec::with_capacity(config.n_epochs);

    for epoch in 0..config.n_epochs {
        let ignored = match config.hold_out {
            Some(hold_out) => Some(hold_out.pick(groups, rng)?),
            None => None,
        };

        let mut batches = Vec::with_capacity(groups.len());
        for &g in groups.iter().filter(|&&g| Some(g) != ignored) {
            let x = sampler
                .sample::<B>(g, config.sample_size, config.sample_with_replacement, rng, device)
                .map_err(TrainError::Sampling)?;
            batches.push(x);
        }
        if batches.is_empty() {
            return Err(TrainError::Sampling(anyhow::anyhow!("no groups left to train on")));
        }
        let x = Tensor::cat(batches, 0);

        let scale = config.noise_scale(rng);
        let [n, dim] = x.dims();
        let noise = noise_tensor::<B>(n, dim, true, rng, device) * scale;
        let z = model.encode(x.clone() + noise);

        let mut loss = Tensor::<B, 1>::zeros([1], device);
        let mut recon_value = None;
        let mut dist_value = None;
        if config.recon {
            let recon_loss = mse.forward(model.decode(z.clone()), x.clone(), Reduction::Mean);
            recon_value = Some(tensor_to_f64(recon_loss.clone()));
            loss = loss + recon_loss;
        }
        if let Some(dist) = dist {
            let target = rows_to_tensor::<B>(&dist.fit(&tensor_to_rows(x.detach())), device);
            let dist_loss = mse.forward(pairwise_sq_dist(z.clone(), z), target, Reduction::Mean);
            dist_value = Some(tensor_to_f64(dist_loss.clone()));
            loss = loss + dist_loss;
        }

        let value = tensor_to_f64(loss.clone());
        if !value.is_finite() {
            return Err(TrainError::NonFiniteLoss { batch: epoch, value });
        }
        if config.log_every > 0 && epoch % config.log_every == 0 {
            tracing::info!(epoch, loss = value, recon = ?recon_value, dist = ?dist_value, noise_scale = scale, "autoencoder");
        }

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(config.lr, model, grads);
        losses.push(value);
    }

    Ok((model, losses))
}
