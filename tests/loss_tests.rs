use face_embed::nn::{Reuse, Scope};
use face_embed::{center_loss, l2_loss, triplet_loss, CenterTable, FaceEmbedError};
use tch::{nn, Device, Tensor};

use test_utils::*;

fn embeddings(values: &[f32], dim: i64) -> Tensor {
    Tensor::from_slice(values).view([-1, dim])
}

#[test]
fn triplet_loss_values() {
    let a = embeddings(&[0., 0., 1., 1.], 2);
    let p = embeddings(&[1., 0., 1., 1.], 2);
    let n = embeddings(&[0., 2., 1., 1.5], 2);
    // Distances: pos [1, 0], neg [4, 0.25].
    let loss = triplet_loss(&a, &p, &n, 0.5).unwrap();
    assert_close(f64_from(&loss), 0.5 * (0. + 0.25));

    // Anchor and positive equal, negative far away: no loss left.
    let loss = triplet_loss(&a, &a, &n, 0.0).unwrap();
    assert_close(f64_from(&loss), 0.0);

    // With alpha 0 and positive equal to negative, the hinge is at zero.
    let loss = triplet_loss(&a, &p, &p, 0.0).unwrap();
    assert_close(f64_from(&loss), 0.0);
    let loss = triplet_loss(&a, &p, &p, 0.2).unwrap();
    assert_close(f64_from(&loss), 0.2);
}

#[test]
fn triplet_loss_shapes() {
    let a = embeddings(&[0., 0., 1., 1.], 2);
    let n = embeddings(&[0., 0.], 2);
    assert!(matches!(triplet_loss(&a, &a, &n, 0.2), Err(FaceEmbedError::Shape(_))));
}

#[test]
fn triplet_loss_gradient() {
    let a = embeddings(&[0., 0.], 2).set_requires_grad(true);
    let p = embeddings(&[1., 0.], 2);
    let n = embeddings(&[0., 1.], 2);
    let loss = triplet_loss(&a, &p, &n, 0.2).unwrap();
    loss.backward();
    // d/da (|a - p|^2 - |a - n|^2) = 2 (n - p)
    assert_eq!(vec_f64_from(&a.grad()), [-2., 2.]);
}

#[test]
fn l2_loss_is_half_squared_norm() {
    let xs = Tensor::from_slice(&[3f32, 4.]);
    assert_close(f64_from(&l2_loss(&xs)), 12.5);
}

#[test]
fn center_loss_at_center() {
    let vs = nn::VarStore::new(Device::Cpu);
    let root = Scope::root(&vs, Reuse::Create);
    let mut table = CenterTable::new(&(&root / "CenterLoss"), 4, 3, 0.95).unwrap();
    let features = Tensor::zeros([5, 3], (tch::Kind::Float, Device::Cpu));
    let labels = Tensor::from_slice(&[2i64, 2, 2, 2, 2]);
    let (loss, centers) = center_loss(&mut table, &features, &labels).unwrap();
    assert_close(f64_from(&loss), 0.0);
    assert_eq!(vec_f64_from(&centers), vec![0.0; 12]);
    assert_eq!(vs.trainable_variables().len(), 0);
}

#[test]
fn center_loss_updates() {
    let vs = nn::VarStore::new(Device::Cpu);
    let mut table = CenterTable::new(&Scope::root(&vs, Reuse::Create), 3, 1, 0.5).unwrap();

    let features = embeddings(&[2., 4.], 1);
    let labels = Tensor::from_slice(&[0i64, 1]);
    let (loss, centers) = table.center_loss(&features, &labels).unwrap();
    // The loss is computed against the centers before the update.
    assert_close(f64_from(&loss), (4. + 16.) / 2.);
    assert_eq!(vec_f64_from(&centers), [1., 2., 0.]);

    // Duplicate labels accumulate their moves on the shared center.
    let features = embeddings(&[1., 3.], 1);
    let labels = Tensor::from_slice(&[2i64, 2]);
    let (_, centers) = table.center_loss(&features, &labels).unwrap();
    assert_eq!(vec_f64_from(&centers), [1., 2., 2.]);
}

#[test]
fn center_loss_errors() {
    let vs = nn::VarStore::new(Device::Cpu);
    let mut table = CenterTable::new(&Scope::root(&vs, Reuse::Create), 3, 2, 0.5).unwrap();
    let features = embeddings(&[1., 1., 2., 2.], 2);
    assert!(matches!(
        table.center_loss(&features, &Tensor::from_slice(&[0i64, 3])),
        Err(FaceEmbedError::Label(_))
    ));
    assert!(matches!(
        table.center_loss(&features, &Tensor::from_slice(&[0i64])),
        Err(FaceEmbedError::Shape(_))
    ));
    assert!(matches!(
        table.center_loss(&embeddings(&[1., 1., 1.], 3), &Tensor::from_slice(&[0i64])),
        Err(FaceEmbedError::Shape(_))
    ));
}
