//! A fully-connected layer.
use tch::{nn::ModuleT, Tensor};

use super::{Activation, BatchNorm, BatchNormConfig, Init, Scope};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FullyConnectedConfig {
    pub normalizer: Option<BatchNormConfig>,
    pub activation: Option<Activation>,
    pub ws_init: Init,
    pub bs_init: Init,
}

impl Default for FullyConnectedConfig {
    /// A linear projection: no normalizer and no activation.
    fn default() -> Self {
        FullyConnectedConfig {
            normalizer: None,
            activation: None,
            ws_init: Init::TruncatedNormal { stdev: 0.1 },
            bs_init: Init::Const(0.),
        }
    }
}

/// A fully-connected layer on `(batch, features)` inputs.
#[derive(Debug)]
pub struct FullyConnected {
    pub weights: Tensor,
    pub biases: Option<Tensor>,
    pub batch_norm: Option<BatchNorm>,
    activation: Option<Activation>,
}

impl FullyConnected {
    pub fn new(
        p: &Scope,
        in_dim: i64,
        out_dim: i64,
        config: FullyConnectedConfig,
    ) -> Result<FullyConnected> {
        let weights = p.var("weights", &[out_dim, in_dim], config.ws_init)?;
        let (biases, batch_norm) = match config.normalizer {
            Some(bn_config) => (None, Some(BatchNorm::new(&(p / "BatchNorm"), out_dim, bn_config)?)),
            None => (Some(p.var("biases", &[out_dim], config.bs_init)?), None),
        };
        Ok(FullyConnected { weights, biases, batch_norm, activation: config.activation })
    }

    pub fn regularized(&self) -> Vec<&Tensor> {
        std::iter::once(&self.weights).chain(self.biases.iter()).collect()
    }
}

impl ModuleT for FullyConnected {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = xs.linear(&self.weights, self.biases.as_ref());
        let ys = match &self.batch_norm {
            Some(bn) => ys.apply_t(bn, train),
            None => ys,
        };
        match self.activation {
            Some(activation) => activation.apply(&ys),
            None => ys,
        }
    }
}
