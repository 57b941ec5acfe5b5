//! Exponential moving average.
use log::debug;
use tch::Tensor;

/// A ExponentialMovingAverage maintains moving averages of a list of variables.
///
/// It keeps shadow copies of the variables. In each step it applies
/// `shadow -= (1 - decay) * (shadow - variable)`. The shadows are kept apart
/// from the variables, `copy_to_variables` loads them, usually before an
/// evaluation.
#[derive(Debug)]
pub struct ExponentialMovingAverage {
    decay: f64,
    shadow_target_vars: Vec<(Tensor, Tensor)>,
}

impl ExponentialMovingAverage {
    /// Constructs a new ExponentialMovingAverage instance.
    pub fn new(vars: &[Tensor], decay: f64) -> ExponentialMovingAverage {
        let shadow_target_vars: Vec<(Tensor, Tensor)> = tch::no_grad(|| {
            vars.iter().map(|var| (var.detach().copy(), var.shallow_clone())).collect()
        });
        debug!("moving average over {} variables, decay {decay}", vars.len());
        ExponentialMovingAverage { decay, shadow_target_vars }
    }

    /// Sets the decay parameter.
    pub fn set_decay(&mut self, decay: f64) {
        self.decay = decay;
    }

    /// The decay used after `num_updates` updates, smaller early in training
    /// so that the averages move quickly away from the initial values.
    pub fn decay_for(&self, num_updates: Option<i64>) -> f64 {
        match num_updates {
            Some(n) => self.decay.min((1. + n as f64) / (10. + n as f64)),
            None => self.decay,
        }
    }

    /// Updates the averages with the current variable values.
    pub fn step(&mut self, num_updates: Option<i64>) {
        let decay = self.decay_for(num_updates);
        tch::no_grad(|| {
            for (shadow, target) in self.shadow_target_vars.iter_mut() {
                *shadow -= (1. - decay) * (&*shadow - &*target);
            }
        });
    }

    /// The averages, in the order the variables were given.
    pub fn averages(&self) -> Vec<Tensor> {
        self.shadow_target_vars.iter().map(|(shadow, _)| shadow.shallow_clone()).collect()
    }

    /// Overwrites the variables with their averages.
    pub fn copy_to_variables(&mut self) {
        tch::no_grad(|| {
            for (shadow, target) in self.shadow_target_vars.iter_mut() {
                target.copy_(shadow);
            }
        });
    }
}

#[test]
fn ema_test() {
    let vs = tch::nn::VarStore::new(tch::Device::Cpu);
    let root = vs.root();

    let t = Tensor::from(1.0_f64);
    let mut var = root.var_copy("dummy", &t);

    let mut ema = ExponentialMovingAverage::new(&vs.trainable_variables(), 0.99);

    let t = Tensor::from(0.5_f64);
    tch::no_grad(|| var.copy_(&t));
    ema.step(None);

    let t = Tensor::from(0.1_f64);
    tch::no_grad(|| var.copy_(&t));
    ema.set_decay(0.98);
    ema.step(None);

    let expect = 1.0 * 0.99 * 0.98 + 0.5 * (1. - 0.99) * 0.98 + 0.1 * (1. - 0.98);
    let average = ema.averages()[0].double_value(&[]);
    assert!((average - expect).abs() <= 0.0000001);
    assert!((var.double_value(&[]) - 0.1).abs() <= 0.0000001);

    ema.copy_to_variables();
    assert!((var.double_value(&[]) - expect).abs() <= 0.0000001);
}

#[test]
fn ema_decay_warmup() {
    let ema = ExponentialMovingAverage::new(&[], 0.9999);
    assert!((ema.decay_for(Some(0)) - 0.1).abs() < 1e-12);
    assert!((ema.decay_for(Some(90)) - 0.91).abs() < 1e-12);
    assert_eq!(ema.decay_for(Some(1_000_000)), 0.9999);
    assert_eq!(ema.decay_for(None), 0.9999);
}
