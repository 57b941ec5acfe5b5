/// The `vision` module groups the image models.
pub mod inception_resnet_v2;
