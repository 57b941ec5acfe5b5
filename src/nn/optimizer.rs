//! Optimizers to be used for gradient-descent based training.
//!
//! The update rules and default hyper-parameters follow the TensorFlow
//! optimizers the face embedding recipes were tuned with, so they differ
//! slightly from the torch ones (e.g. RMSProp adds its epsilon inside the
//! square root and starts its mean square at one).
use std::fmt;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::{FaceEmbedError, Result};

/// The optimization algorithms a training step can be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptimizerKind {
    Adagrad,
    Adadelta,
    Adam,
    RmsProp,
    #[serde(rename = "MOM")]
    Momentum,
}

impl OptimizerKind {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerKind::Adagrad => "ADAGRAD",
            OptimizerKind::Adadelta => "ADADELTA",
            OptimizerKind::Adam => "ADAM",
            OptimizerKind::RmsProp => "RMSPROP",
            OptimizerKind::Momentum => "MOM",
        }
    }

    /// Builds an optimizer with the default hyper-parameters of this kind.
    pub fn build(self, vars: Vec<Tensor>, lr: f64) -> Optimizer {
        match self {
            OptimizerKind::Adagrad => Adagrad::default().build(vars, lr),
            OptimizerKind::Adadelta => Adadelta::default().build(vars, lr),
            OptimizerKind::Adam => Adam::default().build(vars, lr),
            OptimizerKind::RmsProp => RmsProp::default().build(vars, lr),
            OptimizerKind::Momentum => Momentum::default().build(vars, lr),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = FaceEmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ADAGRAD" => Ok(OptimizerKind::Adagrad),
            "ADADELTA" => Ok(OptimizerKind::Adadelta),
            "ADAM" => Ok(OptimizerKind::Adam),
            "RMSPROP" => Ok(OptimizerKind::RmsProp),
            "MOM" => Ok(OptimizerKind::Momentum),
            _ => Err(FaceEmbedError::Optimizer(s.to_string())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An update rule. Implementations describe the per-variable state they
/// need and how a gradient is applied to a variable.
pub trait OptimizerConfig: fmt::Debug + Send {
    /// Creates the state tensors kept for `var`.
    fn slots(&self, var: &Tensor) -> Vec<Tensor>;

    /// Applies `grad` to `var` in place. `step` starts at 1.
    fn update(&self, var: &mut Tensor, grad: &Tensor, slots: &mut [Tensor], lr: f64, step: i64);

    fn build(self, vars: Vec<Tensor>, lr: f64) -> Optimizer
    where
        Self: Sized + 'static,
    {
        Optimizer::new(Box::new(self), vars, lr)
    }
}

/// Parameters for the Adagrad optimizer.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Adagrad {
    pub initial_accumulator: f64,
}

impl Default for Adagrad {
    fn default() -> Self {
        Adagrad { initial_accumulator: 0.1 }
    }
}

impl OptimizerConfig for Adagrad {
    fn slots(&self, var: &Tensor) -> Vec<Tensor> {
        vec![var.ones_like() * self.initial_accumulator]
    }

    fn update(&self, var: &mut Tensor, grad: &Tensor, slots: &mut [Tensor], lr: f64, _step: i64) {
        let accumulator = &mut slots[0];
        *accumulator += grad.square();
        *var -= lr * grad / accumulator.sqrt();
    }
}

/// Parameters for the Adadelta optimizer.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Adadelta {
    pub rho: f64,
    pub eps: f64,
}

impl Default for Adadelta {
    fn default() -> Self {
        Adadelta { rho: 0.9, eps: 1e-6 }
    }
}

impl OptimizerConfig for Adadelta {
    fn slots(&self, var: &Tensor) -> Vec<Tensor> {
        vec![var.zeros_like(), var.zeros_like()]
    }

    fn update(&self, var: &mut Tensor, grad: &Tensor, slots: &mut [Tensor], lr: f64, _step: i64) {
        let rho = self.rho;
        slots[0] *= rho;
        slots[0] += (1. - rho) * grad.square();
        let update = (&slots[1] + self.eps).sqrt() / (&slots[0] + self.eps).sqrt() * grad;
        slots[1] *= rho;
        slots[1] += (1. - rho) * update.square();
        *var -= lr * update;
    }
}

/// Parameters for the Adam optimizer.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Adam {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for Adam {
    fn default() -> Self {
        Adam { beta1: 0.9, beta2: 0.999, eps: 0.1 }
    }
}

impl OptimizerConfig for Adam {
    fn slots(&self, var: &Tensor) -> Vec<Tensor> {
        vec![var.zeros_like(), var.zeros_like()]
    }

    fn update(&self, var: &mut Tensor, grad: &Tensor, slots: &mut [Tensor], lr: f64, step: i64) {
        let (beta1, beta2) = (self.beta1, self.beta2);
        let lr_t = lr * (1. - beta2.powi(step as i32)).sqrt() / (1. - beta1.powi(step as i32));
        slots[0] *= beta1;
        slots[0] += (1. - beta1) * grad;
        slots[1] *= beta2;
        slots[1] += (1. - beta2) * grad.square();
        *var -= lr_t * &slots[0] / (slots[1].sqrt() + self.eps);
    }
}

/// Parameters for the RmsProp optimizer.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RmsProp {
    pub decay: f64,
    pub momentum: f64,
    pub eps: f64,
}

impl Default for RmsProp {
    fn default() -> Self {
        RmsProp { decay: 0.9, momentum: 0.9, eps: 1.0 }
    }
}

impl OptimizerConfig for RmsProp {
    fn slots(&self, var: &Tensor) -> Vec<Tensor> {
        vec![var.ones_like(), var.zeros_like()]
    }

    fn update(&self, var: &mut Tensor, grad: &Tensor, slots: &mut [Tensor], lr: f64, _step: i64) {
        slots[0] *= self.decay;
        slots[0] += (1. - self.decay) * grad.square();
        let step = lr * grad / (&slots[0] + self.eps).sqrt();
        slots[1] *= self.momentum;
        slots[1] += step;
        *var -= &slots[1];
    }
}

/// Parameters for the momentum optimizer.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Momentum {
    pub momentum: f64,
    pub nesterov: bool,
}

impl Default for Momentum {
    fn default() -> Self {
        Momentum { momentum: 0.9, nesterov: true }
    }
}

impl OptimizerConfig for Momentum {
    fn slots(&self, var: &Tensor) -> Vec<Tensor> {
        vec![var.zeros_like()]
    }

    fn update(&self, var: &mut Tensor, grad: &Tensor, slots: &mut [Tensor], lr: f64, _step: i64) {
        let accumulator = &mut slots[0];
        *accumulator *= self.momentum;
        *accumulator += grad;
        if self.nesterov {
            *var -= lr * grad + (lr * self.momentum) * &*accumulator;
        } else {
            *var -= lr * &*accumulator;
        }
    }
}

/// An optimizer over an explicit list of variables.
#[derive(Debug)]
pub struct Optimizer {
    config: Box<dyn OptimizerConfig>,
    variables: Vec<Tensor>,
    slots: Vec<Vec<Tensor>>,
    lr: f64,
    step: i64,
}

impl Optimizer {
    pub fn new(config: Box<dyn OptimizerConfig>, variables: Vec<Tensor>, lr: f64) -> Optimizer {
        let slots: Vec<Vec<Tensor>> =
            tch::no_grad(|| variables.iter().map(|var| config.slots(var)).collect());
        debug!("optimizer {config:?} over {} variables", variables.len());
        Optimizer { config, variables, slots, lr, step: 0 }
    }

    pub fn variables(&self) -> &[Tensor] {
        &self.variables
    }

    pub fn zero_grad(&mut self) {
        for var in self.variables.iter_mut() {
            var.zero_grad();
        }
    }

    /// Applies the current gradients. Variables the loss does not depend on
    /// have no gradient and are left untouched.
    pub fn step(&mut self) {
        self.step += 1;
        let (config, lr, step) = (&self.config, self.lr, self.step);
        tch::no_grad(|| {
            for (var, slots) in self.variables.iter_mut().zip(self.slots.iter_mut()) {
                let grad = var.grad();
                if !grad.defined() {
                    continue;
                }
                config.update(var, &grad, slots, lr, step);
            }
        });
    }

    pub fn backward_step(&mut self, loss: &Tensor) {
        self.zero_grad();
        loss.backward();
        self.step();
    }

    /// Sets the optimizer learning rate.
    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Number of update steps applied so far.
    pub fn steps(&self) -> i64 {
        self.step
    }
}
