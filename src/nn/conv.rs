//! Convolution units: a 2D convolution followed by an optional
//! normalizer and an optional activation.
use tch::{nn::ModuleT, Tensor};

use super::{Activation, BatchNorm, BatchNormConfig, FeatureShape, Init, Layer, Padding, Scope};
use crate::{FaceEmbedError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvUnitConfig {
    pub stride: i64,
    pub padding: Padding,
    /// Batch normalization applied to the convolution output. When set, the
    /// convolution itself has no bias.
    pub normalizer: Option<BatchNormConfig>,
    pub activation: Option<Activation>,
    pub ws_init: Init,
    pub bs_init: Init,
}

impl Default for ConvUnitConfig {
    fn default() -> Self {
        ConvUnitConfig {
            stride: 1,
            padding: Padding::Same,
            normalizer: Some(BatchNormConfig::default()),
            activation: Some(Activation::Relu),
            ws_init: Init::TruncatedNormal { stdev: 0.1 },
            bs_init: Init::Const(0.),
        }
    }
}

impl ConvUnitConfig {
    /// A plain linear convolution: no normalizer, no activation, a bias.
    ///
    /// Residual projections use this so that normalization and
    /// non-linearities only ever happen before the summation.
    pub fn linear() -> Self {
        ConvUnitConfig { normalizer: None, activation: None, ..Default::default() }
    }

    pub fn stride(self, stride: i64) -> Self {
        ConvUnitConfig { stride, ..self }
    }

    pub fn padding(self, padding: Padding) -> Self {
        ConvUnitConfig { padding, ..self }
    }
}

/// A convolution unit, the building block of every branch in the network.
#[derive(Debug)]
pub struct ConvUnit {
    pub weights: Tensor,
    pub biases: Option<Tensor>,
    pub batch_norm: Option<BatchNorm>,
    c_in: i64,
    c_out: i64,
    ksize: [i64; 2],
    stride: i64,
    padding: Padding,
    activation: Option<Activation>,
}

impl ConvUnit {
    pub fn new(
        p: &Scope,
        c_in: i64,
        c_out: i64,
        ksize: [i64; 2],
        config: ConvUnitConfig,
    ) -> Result<ConvUnit> {
        if c_in <= 0 || c_out <= 0 || ksize.iter().any(|&k| k <= 0) || config.stride <= 0 {
            return Err(FaceEmbedError::Shape(format!(
                "{}: invalid convolution {c_in} -> {c_out}, kernel {ksize:?}, stride {}",
                p.name(),
                config.stride
            )));
        }
        let weights = p.var("weights", &[c_out, c_in, ksize[0], ksize[1]], config.ws_init)?;
        let (biases, batch_norm) = match config.normalizer {
            Some(bn_config) => (None, Some(BatchNorm::new(&(p / "BatchNorm"), c_out, bn_config)?)),
            None => (Some(p.var("biases", &[c_out], config.bs_init)?), None),
        };
        Ok(ConvUnit {
            weights,
            biases,
            batch_norm,
            c_in,
            c_out,
            ksize,
            stride: config.stride,
            padding: config.padding,
            activation: config.activation,
        })
    }

    pub fn out_channels(&self) -> i64 {
        self.c_out
    }
}

impl ModuleT for ConvUnit {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let size = xs.size();
        let (h, w) = (size[size.len() - 2], size[size.len() - 1]);
        let (top, bottom) = self.padding.pads(h, self.ksize[0], self.stride);
        let (left, right) = self.padding.pads(w, self.ksize[1], self.stride);
        let stride = [self.stride, self.stride];
        let ys = if top == bottom && left == right {
            xs.conv2d(&self.weights, self.biases.as_ref(), stride, [top, left], [1, 1], 1)
        } else {
            xs.constant_pad_nd([left, right, top, bottom]).conv2d(
                &self.weights,
                self.biases.as_ref(),
                stride,
                [0, 0],
                [1, 1],
                1,
            )
        };
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

impl Layer for ConvUnit {
    fn output_shape(&self, input: FeatureShape) -> Result<FeatureShape> {
        if input.channels != self.c_in {
            return Err(FaceEmbedError::Shape(format!(
                "convolution expects {} input channels, got {}",
                self.c_in, input.channels
            )));
        }
        Ok(FeatureShape {
            channels: self.c_out,
            height: self.padding.output_size(input.height, self.ksize[0], self.stride)?,
            width: self.padding.output_size(input.width, self.ksize[1], self.stride)?,
        })
    }

    fn regularized(&self) -> Vec<&Tensor> {
        std::iter::once(&self.weights).chain(self.biases.iter()).collect()
    }
}
