//! Training configuration, read from JSON.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::data::{LearningRateSchedule, DEFAULT_LEARNING_RATE};
use crate::nn::OptimizerKind;
use crate::{FaceEmbedError, Result};

/// Hyper-parameters of a training run. Every field is optional in the JSON
/// file and falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub optimizer: OptimizerKind,
    /// Used when no schedule file is configured.
    pub learning_rate: f64,
    pub learning_rate_schedule_file: Option<PathBuf>,
    pub moving_average_decay: f64,
    pub keep_prob: f64,
    pub embedding_size: i64,
    pub weight_decay: f64,
    pub triplet_alpha: f64,
    pub center_loss_alpha: f64,
    pub center_loss_factor: f64,
    pub batch_size: i64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            optimizer: OptimizerKind::Adagrad,
            learning_rate: DEFAULT_LEARNING_RATE,
            learning_rate_schedule_file: None,
            moving_average_decay: 0.9999,
            keep_prob: 0.8,
            embedding_size: 128,
            weight_decay: 0.0,
            triplet_alpha: 0.2,
            center_loss_alpha: 0.95,
            center_loss_factor: 0.0,
            batch_size: 90,
        }
    }
}

impl TrainConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<TrainConfig> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let config: TrainConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        info!("loaded training config from {}: {config:?}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return Err(FaceEmbedError::Config(format!(
                "keep_prob must be in (0, 1], got {}",
                self.keep_prob
            )));
        }
        if self.embedding_size <= 0 || self.batch_size <= 0 {
            return Err(FaceEmbedError::Config(format!(
                "embedding_size and batch_size must be positive, got {} and {}",
                self.embedding_size, self.batch_size
            )));
        }
        Ok(())
    }

    /// The learning rate to train `epoch` with.
    pub fn learning_rate_for_epoch(&self, epoch: i64) -> Result<f64> {
        match &self.learning_rate_schedule_file {
            Some(path) => Ok(LearningRateSchedule::from_file(path)?.rate(epoch)),
            None => Ok(self.learning_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json() {
        let config: TrainConfig =
            serde_json::from_str(r#"{"optimizer": "MOM", "batch_size": 30}"#).unwrap();
        assert_eq!(config.optimizer, OptimizerKind::Momentum);
        assert_eq!(config.batch_size, 30);
        assert_eq!(config.keep_prob, 0.8);
        assert_eq!(config.learning_rate_for_epoch(12).unwrap(), 0.1);
    }

    #[test]
    fn unknown_optimizer() {
        assert!(serde_json::from_str::<TrainConfig>(r#"{"optimizer": "SGD"}"#).is_err());
        let config = TrainConfig { keep_prob: 0.0, ..Default::default() };
        assert!(matches!(config.validate(), Err(FaceEmbedError::Config(_))));
    }
}
