use burn::prelude::*;

use crate::model::mlp::{Activation, Mlp, MlpConfig};

/// An embedding used to train and evaluate trajectories in a learned space.
pub trait Autoencoder<B: Backend> {
    /// `(n, d)` → `(n, latent)`.
    fn encode(&self, x: Tensor<B, 2>) -> Tensor<B, 2>;
    /// `(n, latent)` → `(n, d)`.
    fn decode(&self, z: Tensor<B, 2>) -> Tensor<B, 2>;
}

/// Configuration for [`GeodesicAutoencoder`].
#[derive(Config, Debug)]
pub struct GeodesicAutoencoderConfig {
    /// Input (feature) dimension.
    pub dim: usize,
    /// Embedding dimension.
    #[config(default = 2)]
    pub latent_dim: usize,
    /// Encoder hidden widths; the decoder mirrors them.
    #[config(default = "vec![64, 64]")]
    pub hidden: Vec<usize>,
    #[config(default = "Activation::Relu")]
    pub activation: Activation,
}

/// MLP encoder/decoder pair trained to preserve (geodesic) distances in the
/// latent space.
#[derive(Module, Debug)]
pub struct GeodesicAutoencoder<B: Backend> {
    encoder: Mlp<B>,
    decoder: Mlp<B>,
}

impl GeodesicAutoencoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GeodesicAutoencoder<B> {
        let mut reversed = self.hidden.clone();
        reversed.reverse();
        GeodesicAutoencoder {
            encoder: MlpConfig::new(self.dim, self.latent_dim)
                .with_hidden(self.hidden.clone())
                .with_activation(self.activation)
                .init(device),
            decoder: MlpConfig::new(self.latent_dim, self.dim)
                .with_hidden(reversed)
                .with_activation(self.activation)
                .init(device),
        }
    }
}

impl<B: Backend> Autoencoder<B> for GeodesicAutoencoder<B> {
    fn encode(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.encoder.forward(x)
    }

    fn decode(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        self.decoder.forward(z)
    }
}
