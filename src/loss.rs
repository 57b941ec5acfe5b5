//! Embedding losses.
//!
//! The triplet loss follows "FaceNet: A Unified Embedding for Face
//! Recognition and Clustering", Schroff et al. 2015. The center loss follows
//! "A Discriminative Feature Learning Approach for Deep Face Recognition",
//! Wen et al. 2016.
use tch::{Kind, Tensor};

use crate::nn::Scope;
use crate::{FaceEmbedError, Result};

/// Half the squared L2 norm of a tensor.
pub fn l2_loss(xs: &Tensor) -> Tensor {
    xs.square().sum(Kind::Float) / 2.
}

fn squared_distance(xs: &Tensor, ys: &Tensor) -> Tensor {
    (xs - ys).square().sum_dim_intlist(Some([1i64].as_slice()), false, Kind::Float)
}

/// `mean(max(0, |a - p|^2 - |a - n|^2 + alpha))` over the batch.
pub fn triplet_loss(
    anchor: &Tensor,
    positive: &Tensor,
    negative: &Tensor,
    alpha: f64,
) -> Result<Tensor> {
    let shape = anchor.size();
    if shape.len() != 2 || positive.size() != shape || negative.size() != shape {
        return Err(FaceEmbedError::Shape(format!(
            "triplet embeddings must share a (batch, dim) shape, got {:?} {:?} {:?}",
            shape,
            positive.size(),
            negative.size()
        )));
    }
    let pos_dist = squared_distance(anchor, positive);
    let neg_dist = squared_distance(anchor, negative);
    Ok((pos_dist - neg_dist + alpha).clamp_min(0.0).mean(Kind::Float))
}

/// Per-class embedding centers for the center loss.
///
/// The table is a non-trainable `(num_classes, dim)` variable, zero at
/// creation and moved towards the embeddings of its class on every call to
/// `center_loss`.
#[derive(Debug)]
pub struct CenterTable {
    centers: Tensor,
    alpha: f64,
    num_classes: i64,
}

impl CenterTable {
    pub fn new(p: &Scope, num_classes: i64, dim: i64, alpha: f64) -> Result<CenterTable> {
        let centers = p.zeros_no_train("centers", &[num_classes, dim])?;
        Ok(CenterTable { centers, alpha, num_classes })
    }

    pub fn centers(&self) -> &Tensor {
        &self.centers
    }

    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    /// Returns the center loss of `features` and updates the centers of the
    /// classes present in `labels`.
    ///
    /// Each example moves its class center by `(1 - alpha) * (feature - center)`
    /// computed from the center as it was before the call. When several
    /// examples share a label their moves add up on that row.
    pub fn center_loss(&mut self, features: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, dim) = features.size2()?;
        let (_, center_dim) = self.centers.size2()?;
        if dim != center_dim {
            return Err(FaceEmbedError::Shape(format!(
                "features have {dim} dimensions, centers have {center_dim}"
            )));
        }
        let labels = labels.reshape([-1]).to_kind(Kind::Int64);
        if labels.size()[0] != batch {
            return Err(FaceEmbedError::Shape(format!(
                "{} labels for a batch of {batch} features",
                labels.size()[0]
            )));
        }
        if batch > 0 {
            let (min, max) = (labels.min().int64_value(&[]), labels.max().int64_value(&[]));
            if min < 0 || max >= self.num_classes {
                return Err(FaceEmbedError::Label(format!(
                    "labels span [{min}, {max}], the table has {} classes",
                    self.num_classes
                )));
            }
        }
        let center_feats = self.centers.index_select(0, &labels);
        let loss = l2_loss(&(features - &center_feats));
        let alpha = self.alpha;
        let centers = &mut self.centers;
        tch::no_grad(|| {
            let diff = (1. - alpha) * (&center_feats - features.detach());
            let _ = centers.index_add_(0, &labels, &(-diff));
        });
        Ok((loss, self.centers.shallow_clone()))
    }
}

/// Center loss of `features` against `table`, see [`CenterTable::center_loss`].
pub fn center_loss(
    table: &mut CenterTable,
    features: &Tensor,
    labels: &Tensor,
) -> Result<(Tensor, Tensor)> {
    table.center_loss(features, labels)
}
