//! Layers, optimizers and moving averages used to build and train the
//! embedding network.
//!
//! Padding follows the TensorFlow `SAME` / `VALID` conventions so that the
//! spatial sizes of the network match the published architecture.
use tch::{nn::ModuleT, Tensor};

use crate::{FaceEmbedError, Result};

pub mod init;
pub use init::{init, Init};

mod scope;
pub use scope::{variables_with_prefix, Reuse, Scope};

mod batch_norm;
pub use batch_norm::*;

mod conv;
pub use conv::*;

mod pool;
pub use pool::*;

mod linear;
pub use linear::*;

mod optimizer;
pub use optimizer::{
    Adadelta, Adagrad, Adam, Momentum, Optimizer, OptimizerConfig, OptimizerKind, RmsProp,
};

mod ema;
pub use ema::ExponentialMovingAverage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Pad so that the output size is `ceil(input / stride)`, the extra
    /// pixel going to the bottom / right when the padding is odd.
    Same,
    /// No padding.
    Valid,
}

impl Padding {
    /// Output size along one axis.
    pub fn output_size(self, input: i64, ksize: i64, stride: i64) -> Result<i64> {
        match self {
            Padding::Valid if input < ksize => Err(FaceEmbedError::Shape(format!(
                "input of size {input} is smaller than the {ksize} window"
            ))),
            Padding::Valid => Ok((input - ksize) / stride + 1),
            Padding::Same if input < 1 => {
                Err(FaceEmbedError::Shape(format!("empty input of size {input}")))
            }
            Padding::Same => Ok((input + stride - 1) / stride),
        }
    }

    /// Padding before and after the input along one axis.
    pub fn pads(self, input: i64, ksize: i64, stride: i64) -> (i64, i64) {
        match self {
            Padding::Valid => (0, 0),
            Padding::Same => {
                let output = (input + stride - 1) / stride;
                let total = ((output - 1) * stride + ksize - input).max(0);
                (total / 2, total - total / 2)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
}

impl Activation {
    pub fn apply(self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Relu => xs.relu(),
        }
    }
}

/// Shape of a feature map without its batch dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureShape {
    pub channels: i64,
    pub height: i64,
    pub width: i64,
}

impl FeatureShape {
    pub fn new(channels: i64, height: i64, width: i64) -> FeatureShape {
        FeatureShape { channels, height, width }
    }

    pub fn spatial(&self) -> (i64, i64) {
        (self.height, self.width)
    }
}

/// A module whose output shape can be derived ahead of running it.
pub trait Layer: ModuleT {
    /// The output shape for a given input, or a shape error when the input
    /// does not fit.
    fn output_shape(&self, input: FeatureShape) -> Result<FeatureShape>;

    /// The weights and biases subject to L2 regularization.
    fn regularized(&self) -> Vec<&Tensor>;
}
