use burn::module::Ignored;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Nonlinearity applied between the hidden layers of an [`Mlp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    LeakyRelu,
    Tanh,
    Silu,
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        use burn::tensor::activation;
        match self {
            Self::Relu => activation::relu(x),
            Self::LeakyRelu => activation::leaky_relu(x, 0.01),
            Self::Tanh => activation::tanh(x),
            Self::Silu => activation::silu(x),
        }
    }
}

/// Configuration for a fully connected network.
///
/// ```text
/// (batch, d_input)
///   → Linear(d_input→hidden[0]) → act
///   → …
///   → Linear(hidden[last]→d_output)
///   → (batch, d_output)
/// ```
#[derive(Config, Debug)]
pub struct MlpConfig {
    /// Input dimension.
    pub d_input: usize,
    /// Output dimension.
    pub d_output: usize,
    /// Hidden layer widths. Empty means a single linear map.
    #[config(default = "vec![64, 64]")]
    pub hidden: Vec<usize>,
    /// Activation after every hidden layer.
    #[config(default = "Activation::LeakyRelu")]
    pub activation: Activation,
}

/// Plain multi-layer perceptron, the building block of vector fields and autoencoders.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<Linear<B>>,
    activation: Ignored<Activation>,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        let mut widths = Vec::with_capacity(self.hidden.len() + 2);
        widths.push(self.d_input);
        widths.extend_from_slice(&self.hidden);
        widths.push(self.d_output);

        let layers = widths
            .windows(2)
            .map(|w| LinearConfig::new(w[0], w[1]).init(device))
            .collect();
        Mlp {
            layers,
            activation: Ignored(self.activation),
        }
    }
}

impl<B: Backend> Mlp<B> {
    /// Input shape: `(batch, d_input)`. Output shape: `(batch, d_output)`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.layers.len().saturating_sub(1);
        let mut h = x;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(h);
            if i < last {
                h = self.activation.0.apply(h);
            }
        }
        h
    }

    /// Number of linear layers.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}
