//! Variable initialization.
use tch::{Device, Kind, Tensor};

/// Number of resampling rounds before the remaining outliers get clamped.
const TRUNCATION_ROUNDS: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Init {
    /// Constant value.
    Const(f64),
    /// Normal distribution centered on zero, values further than two
    /// standard deviations away are drawn again.
    TruncatedNormal { stdev: f64 },
}

pub fn init(i: Init, dims: &[i64], device: Device) -> Tensor {
    match i {
        Init::Const(cst) => {
            if cst == 0. {
                Tensor::zeros(dims, (Kind::Float, device))
            } else {
                Tensor::ones(dims, (Kind::Float, device)) * cst
            }
        }
        Init::TruncatedNormal { stdev } => truncated_normal(dims, device) * stdev,
    }
}

/// Standard normal samples restricted to `[-2, 2]`.
fn truncated_normal(dims: &[i64], device: Device) -> Tensor {
    let mut xs = Tensor::randn(dims, (Kind::Float, device));
    for _ in 0..TRUNCATION_ROUNDS {
        let outside = xs.abs().gt(2.0);
        if outside.sum(Kind::Int64).int64_value(&[]) == 0 {
            return xs;
        }
        let redraw = Tensor::randn(dims, (Kind::Float, device));
        xs = redraw.where_self(&outside, &xs);
    }
    xs.clamp(-2.0, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_normal_stays_in_range() {
        let xs = init(Init::TruncatedNormal { stdev: 0.1 }, &[64, 64], Device::Cpu);
        assert_eq!(xs.size(), [64, 64]);
        assert!(xs.abs().max().double_value(&[]) <= 0.2 + 1e-6);
        assert!(xs.std(true).double_value(&[]) > 0.05);
    }

    #[test]
    fn const_init() {
        let xs = init(Init::Const(0.1), &[3], Device::Cpu);
        assert!((xs.sum(Kind::Float).double_value(&[]) - 0.3).abs() < 1e-6);
    }
}
