//! Max and average pooling.
use tch::{nn::ModuleT, Tensor};

use super::{FeatureShape, Layer, Padding};
use crate::{FaceEmbedError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Avg,
}

/// A square pooling window.
///
/// `Same` padding is only available for stride 1 and odd windows, where the
/// padding is symmetric. Padded cells are never counted by average pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    kind: PoolKind,
    ksize: i64,
    stride: i64,
    padding: Padding,
}

impl Pool {
    pub fn new(kind: PoolKind, ksize: i64, stride: i64, padding: Padding) -> Result<Pool> {
        if ksize <= 0 || stride <= 0 {
            return Err(FaceEmbedError::Shape(format!("invalid pooling {ksize}x{ksize}/{stride}")));
        }
        if padding == Padding::Same && (stride != 1 || ksize % 2 == 0) {
            return Err(FaceEmbedError::Shape(format!(
                "SAME pooling needs stride 1 and an odd window, got {ksize}x{ksize}/{stride}"
            )));
        }
        Ok(Pool { kind, ksize, stride, padding })
    }

    pub fn max(ksize: i64, stride: i64, padding: Padding) -> Result<Pool> {
        Pool::new(PoolKind::Max, ksize, stride, padding)
    }

    pub fn avg(ksize: i64, stride: i64, padding: Padding) -> Result<Pool> {
        Pool::new(PoolKind::Avg, ksize, stride, padding)
    }

    fn pad(&self) -> i64 {
        match self.padding {
            Padding::Same => self.ksize / 2,
            Padding::Valid => 0,
        }
    }
}

impl ModuleT for Pool {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        let (k, s, pad) = (self.ksize, self.stride, self.pad());
        match self.kind {
            PoolKind::Max => xs.max_pool2d([k, k], [s, s], [pad, pad], [1, 1], false),
            PoolKind::Avg => xs.avg_pool2d([k, k], [s, s], [pad, pad], false, false, None),
        }
    }
}

impl Layer for Pool {
    fn output_shape(&self, input: FeatureShape) -> Result<FeatureShape> {
        Ok(FeatureShape {
            channels: input.channels,
            height: self.padding.output_size(input.height, self.ksize, self.stride)?,
            width: self.padding.output_size(input.width, self.ksize, self.stride)?,
        })
    }

    fn regularized(&self) -> Vec<&Tensor> {
        vec![]
    }
}
