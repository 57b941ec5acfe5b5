use face_embed::nn::{self as fnn, Init, OptimizerKind, Reuse, Scope};
use face_embed::{get_fusion_train_op, get_train_op, FaceEmbedError};
use tch::{nn, Device, Kind, Tensor};

use test_utils::*;

fn scalar_var(vs: &nn::VarStore, name: &str) -> Tensor {
    vs.root().var_copy(name, &Tensor::from_slice(&[1f32]))
}

fn first_step(kind: OptimizerKind) -> f64 {
    let vs = nn::VarStore::new(Device::Cpu);
    let x = scalar_var(&vs, "x");
    let mut opt = kind.build(vec![x.shallow_clone()], 0.1);
    opt.backward_step(&x.sum(Kind::Float));
    assert_eq!(opt.steps(), 1);
    f64_from(&x.sum(Kind::Float))
}

#[test]
fn optimizer_names() {
    for name in ["ADAGRAD", "ADADELTA", "ADAM", "RMSPROP", "MOM"] {
        let kind: OptimizerKind = name.parse().unwrap();
        assert_eq!(kind.to_string(), name);
    }
    let err = "SGD".parse::<OptimizerKind>().unwrap_err();
    assert!(matches!(err, FaceEmbedError::Optimizer(_)));
    assert_eq!(err.to_string(), "invalid optimization algorithm: SGD");
}

#[test]
fn optimizer_first_steps() {
    assert_close(first_step(OptimizerKind::Adagrad), 1. - 0.1 / 1.1f64.sqrt());
    assert_close(first_step(OptimizerKind::Momentum), 0.81);
    assert_close(first_step(OptimizerKind::Adam), 0.9759747);
    assert_close(first_step(OptimizerKind::RmsProp), 1. - 0.1 / 2f64.sqrt());
    assert_close(first_step(OptimizerKind::Adadelta), 0.99968377);
}

#[test]
fn optimizer_fits_linear_data() {
    tch::manual_seed(42);
    let xs = Tensor::from_slice(&(1..15).collect::<Vec<i64>>()).to_kind(Kind::Float).view([-1, 1]);
    let ys = &xs * 0.42 + 1.337;

    let vs = nn::VarStore::new(Device::Cpu);
    let root = Scope::root(&vs, Reuse::Create);
    let cfg = fnn::FullyConnectedConfig { ws_init: Init::Const(0.), ..Default::default() };
    let linear = fnn::FullyConnected::new(&root, 1, 1, cfg).unwrap();
    let mut opt = OptimizerKind::Adam.build(vs.trainable_variables(), 0.1);

    let loss = xs.apply_t(&linear, true).mse_loss(&ys, tch::Reduction::Mean);
    let initial_loss = f64_from(&loss);
    assert!(initial_loss > 1.0, "initial loss {initial_loss}");
    for _idx in 1..500 {
        let loss = xs.apply_t(&linear, true).mse_loss(&ys, tch::Reduction::Mean);
        opt.backward_step(&loss);
    }
    let final_loss = f64_from(&xs.apply_t(&linear, true).mse_loss(&ys, tch::Reduction::Mean));
    assert!(final_loss < initial_loss / 10., "final loss {final_loss}");
}

#[test]
fn unused_variables_are_left_alone() {
    let vs = nn::VarStore::new(Device::Cpu);
    let x = scalar_var(&vs, "x");
    let y = scalar_var(&vs, "y");
    let mut opt = OptimizerKind::Momentum.build(vs.trainable_variables(), 0.1);
    opt.backward_step(&x.sum(Kind::Float));
    assert_close(f64_from(&x.sum(Kind::Float)), 0.81);
    assert_close(f64_from(&y.sum(Kind::Float)), 1.0);
}

#[test]
fn train_op_with_moving_average() {
    let vs = nn::VarStore::new(Device::Cpu);
    let x = scalar_var(&vs, "x");
    let mut train_op = get_train_op("MOM", 0.1, 0.9999, vs.trainable_variables()).unwrap();
    assert_eq!(train_op.run(&x.sum(Kind::Float)), 1);
    assert_eq!(train_op.global_step(), 1);
    assert_close(f64_from(&x.sum(Kind::Float)), 0.81);
    // After one step the decay is min(0.9999, 2 / 11).
    let average = f64_from(&train_op.ema().averages()[0].sum(Kind::Float));
    assert_close(average, 1. - (9. / 11.) * 0.19);

    train_op.ema_mut().copy_to_variables();
    assert_close(f64_from(&x.sum(Kind::Float)), average);

    assert!(matches!(
        get_train_op("SGD", 0.1, 0.9999, vs.trainable_variables()),
        Err(FaceEmbedError::Optimizer(_))
    ));
}

#[test]
fn fusion_train_op() {
    let vs = nn::VarStore::new(Device::Cpu);
    let root = Scope::root(&vs, Reuse::Create);
    let base = (&root / "InceptionResnetV2").var("weights", &[1], Init::Const(1.)).unwrap();
    let fusion = (&root / "Fusion").var("weights", &[1], Init::Const(1.)).unwrap();

    let var_list1 = fnn::variables_with_prefix(&vs, "InceptionResnetV2");
    let var_list2 = fnn::variables_with_prefix(&vs, "Fusion");
    assert_eq!((var_list1.len(), var_list2.len()), (1, 1));

    let mut train_op =
        get_fusion_train_op("ADAGRAD", 0.1, var_list1, 0.0, var_list2, 0.9999).unwrap();
    assert_eq!(train_op.optimizers().len(), 2);
    let loss = (&base + &fusion).sum(Kind::Float);
    // Both optimizers count their update in the global step.
    assert_eq!(train_op.run(&loss), 2);
    let stepped = 1. - 0.1 / 1.1f64.sqrt();
    assert_close(f64_from(&base.sum(Kind::Float)), stepped);
    assert_close(f64_from(&fusion.sum(Kind::Float)), 1.0);
    assert_eq!(train_op.learning_rates(), [0.1, 0.0]);
    assert!(train_op.optimizers().iter().all(|opt| opt.steps() == 1));
    // The moving averages decay with min(0.9999, (1 + 2) / (10 + 2)).
    let average = f64_from(&train_op.ema().averages()[0].sum(Kind::Float));
    assert_close(average, 1. - 0.75 * (1. - stepped));

    train_op.set_learning_rates(&[0.0, 0.1]);
    let loss = (&base + &fusion).sum(Kind::Float);
    assert_eq!(train_op.run(&loss), 4);
    assert_eq!(train_op.global_step(), 4);
    assert_close(f64_from(&base.sum(Kind::Float)), stepped);
    assert!(f64_from(&fusion.sum(Kind::Float)) < 1.0);

    assert!(matches!(
        get_fusion_train_op("sgd", 0.1, vec![], 0.1, vec![], 0.9999),
        Err(FaceEmbedError::Optimizer(_))
    ));
}
