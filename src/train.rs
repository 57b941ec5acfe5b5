//! Training steps: optimizer updates followed by a moving-average update.
use log::{debug, info};
use tch::Tensor;

use crate::nn::{ExponentialMovingAverage, Optimizer, OptimizerKind};
use crate::Result;

/// A composite training step.
///
/// Running it applies every optimizer to its own variable partition, bumps
/// the global step once per optimizer and then updates the moving averages
/// of all the partitions. The step is complete only once all of these have happened.
#[derive(Debug)]
pub struct TrainOp {
    optimizers: Vec<Optimizer>,
    ema: ExponentialMovingAverage,
    global_step: i64,
}

impl TrainOp {
    pub fn new(optimizers: Vec<Optimizer>, moving_average_decay: f64) -> TrainOp {
        let variables: Vec<Tensor> = optimizers
            .iter()
            .flat_map(|opt| opt.variables().iter().map(|var| var.shallow_clone()))
            .collect();
        let ema = ExponentialMovingAverage::new(&variables, moving_average_decay);
        TrainOp { optimizers, ema, global_step: 0 }
    }

    /// Runs one training step on `total_loss` and returns the new global step.
    pub fn run(&mut self, total_loss: &Tensor) -> i64 {
        for opt in self.optimizers.iter_mut() {
            opt.zero_grad();
        }
        total_loss.backward();
        for opt in self.optimizers.iter_mut() {
            opt.step();
        }
        // Every optimizer counts its update in the global step.
        self.global_step += self.optimizers.len() as i64;
        self.ema.step(Some(self.global_step));
        debug!("train step {}", self.global_step);
        self.global_step
    }

    pub fn global_step(&self) -> i64 {
        self.global_step
    }

    /// Sets the learning rate of every partition, in the order the
    /// partitions were given.
    pub fn set_learning_rates(&mut self, lrs: &[f64]) {
        for (opt, &lr) in self.optimizers.iter_mut().zip(lrs) {
            opt.set_lr(lr);
        }
    }

    pub fn learning_rates(&self) -> Vec<f64> {
        self.optimizers.iter().map(|opt| opt.lr()).collect()
    }

    pub fn optimizers(&self) -> &[Optimizer] {
        &self.optimizers
    }

    pub fn ema(&self) -> &ExponentialMovingAverage {
        &self.ema
    }

    pub fn ema_mut(&mut self) -> &mut ExponentialMovingAverage {
        &mut self.ema
    }
}

/// Builds a training step updating `var_list` with `optimizer` (one of
/// `ADAGRAD`, `ADADELTA`, `ADAM`, `RMSPROP`, `MOM`).
pub fn get_train_op(
    optimizer: &str,
    lr: f64,
    moving_average_decay: f64,
    var_list: Vec<Tensor>,
) -> Result<TrainOp> {
    let kind: OptimizerKind = optimizer.parse()?;
    info!("{kind} training step over {} variables, lr {lr}", var_list.len());
    Ok(TrainOp::new(vec![kind.build(var_list, lr)], moving_average_decay))
}

/// Builds a training step where the base network (`var_list1`) and the
/// fusion part (`var_list2`) are updated with their own learning rates.
pub fn get_fusion_train_op(
    optimizer: &str,
    lr_base: f64,
    var_list1: Vec<Tensor>,
    lr_fusion: f64,
    var_list2: Vec<Tensor>,
    moving_average_decay: f64,
) -> Result<TrainOp> {
    let kind: OptimizerKind = optimizer.parse()?;
    info!(
        "{kind} fusion training step, {} base variables (lr {lr_base}), {} fusion variables (lr {lr_fusion})",
        var_list1.len(),
        var_list2.len()
    );
    let optimizers = vec![kind.build(var_list1, lr_base), kind.build(var_list2, lr_fusion)];
    Ok(TrainOp::new(optimizers, moving_average_decay))
}
