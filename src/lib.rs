//! Inception-ResNet-v2 face embeddings on top of `tch`.
//!
//! The crate provides the embedding network, the triplet and center losses
//! used to shape the embedding space, and the optimizer / moving-average
//! machinery that turns a loss into a training step.
mod error;
pub use error::{FaceEmbedError, Result};

pub mod config;
pub mod data;
pub mod loss;
pub mod nn;
pub mod train;
pub mod vision;

pub use config::TrainConfig;
pub use loss::{center_loss, l2_loss, triplet_loss, CenterTable};
pub use train::{get_fusion_train_op, get_train_op, TrainOp};
pub use vision::inception_resnet_v2::{inference, InceptionResnetV2};
