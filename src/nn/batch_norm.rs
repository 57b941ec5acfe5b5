//! A batch-normalization layer.
use tch::{nn::ModuleT, Tensor};

use super::{Init, Scope};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormConfig {
    /// Decay of the moving statistics, torch calls `1 - decay` the momentum.
    pub decay: f64,
    pub eps: f64,
    /// Learn an offset `beta`.
    pub center: bool,
    /// Learn a multiplier `gamma`.
    pub scale: bool,
    pub cudnn_enabled: bool,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        BatchNormConfig { decay: 0.995, eps: 0.001, center: true, scale: false, cudnn_enabled: true }
    }
}

/// A batch-normalization layer.
///
/// The moving statistics are non-trainable variables updated in place when
/// the layer runs in training mode.
#[derive(Debug)]
pub struct BatchNorm {
    config: BatchNormConfig,
    pub moving_mean: Tensor,
    pub moving_variance: Tensor,
    pub gamma: Option<Tensor>,
    pub beta: Option<Tensor>,
}

impl BatchNorm {
    pub fn new(p: &Scope, out_dim: i64, config: BatchNormConfig) -> Result<BatchNorm> {
        let beta = if config.center { Some(p.var("beta", &[out_dim], Init::Const(0.))?) } else { None };
        let gamma =
            if config.scale { Some(p.var("gamma", &[out_dim], Init::Const(1.))?) } else { None };
        Ok(BatchNorm {
            config,
            moving_mean: p.zeros_no_train("moving_mean", &[out_dim])?,
            moving_variance: p.ones_no_train("moving_variance", &[out_dim])?,
            gamma,
            beta,
        })
    }
}

impl ModuleT for BatchNorm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        Tensor::batch_norm(
            xs,
            self.gamma.as_ref(),
            self.beta.as_ref(),
            Some(&self.moving_mean),
            Some(&self.moving_variance),
            train,
            1.0 - self.config.decay,
            self.config.eps,
            self.config.cudnn_enabled,
        )
    }
}
