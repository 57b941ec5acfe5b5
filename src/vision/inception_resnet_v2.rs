//! Inception-ResNet-v2 producing face embeddings.
//!
//! See "Inception-v4, Inception-ResNet and the Impact of Residual Connections
//! on Learning", Szegedy et al. 2016
//! https://arxiv.org/abs/1602.07261
//!
//! The classification head of the paper is replaced by a linear bottleneck
//! producing a fixed-size embedding per image.
use log::debug;
use tch::{nn, nn::ModuleT, Kind, Tensor};

use crate::loss::l2_loss;
use crate::nn::{
    Activation, ConvUnit, ConvUnitConfig, FeatureShape, FullyConnected, FullyConnectedConfig,
    Layer, Padding, Pool, Reuse, Scope,
};
use crate::{FaceEmbedError, Result};

pub const DEFAULT_BOTTLENECK_SIZE: i64 = 128;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub in_channels: i64,
    /// Fraction of the pooled features kept by dropout during training.
    pub keep_prob: f64,
    pub bottleneck_size: i64,
    /// Scale of the L2 penalty on the convolution and bottleneck weights.
    pub weight_decay: f64,
    pub block35_repeats: usize,
    pub block17_repeats: usize,
    pub block8_repeats: usize,
    pub block35_scale: f64,
    pub block17_scale: f64,
    pub block8_scale: f64,
    /// Convolutions inside the branches.
    pub conv: ConvUnitConfig,
    /// The 1x1 convolutions projecting a residual block back onto its input.
    pub projection: ConvUnitConfig,
    pub bottleneck: FullyConnectedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            in_channels: 3,
            keep_prob: 0.8,
            bottleneck_size: DEFAULT_BOTTLENECK_SIZE,
            weight_decay: 0.0,
            block35_repeats: 10,
            block17_repeats: 20,
            block8_repeats: 9,
            block35_scale: 0.17,
            block17_scale: 0.10,
            block8_scale: 0.20,
            conv: ConvUnitConfig::default(),
            projection: ConvUnitConfig::linear(),
            bottleneck: FullyConnectedConfig::default(),
        }
    }
}

#[derive(Debug)]
enum Op {
    Conv(ConvUnit),
    Pool(Pool),
}

impl Op {
    fn out_channels(&self, c_in: i64) -> i64 {
        match self {
            Op::Conv(conv) => conv.out_channels(),
            Op::Pool(_) => c_in,
        }
    }
}

impl ModuleT for Op {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            Op::Conv(conv) => conv.forward_t(xs, train),
            Op::Pool(pool) => pool.forward_t(xs, train),
        }
    }
}

impl Layer for Op {
    fn output_shape(&self, input: FeatureShape) -> Result<FeatureShape> {
        match self {
            Op::Conv(conv) => conv.output_shape(input),
            Op::Pool(pool) => pool.output_shape(input),
        }
    }

    fn regularized(&self) -> Vec<&Tensor> {
        match self {
            Op::Conv(conv) => conv.regularized(),
            Op::Pool(_) => vec![],
        }
    }
}

fn conv(p: Scope, c_in: i64, c_out: i64, ksize: i64, config: ConvUnitConfig) -> Result<Op> {
    Ok(Op::Conv(ConvUnit::new(&p, c_in, c_out, [ksize, ksize], config)?))
}

fn conv2(p: Scope, c_in: i64, c_out: i64, ksize: [i64; 2], config: ConvUnitConfig) -> Result<Op> {
    Ok(Op::Conv(ConvUnit::new(&p, c_in, c_out, ksize, config)?))
}

fn max_pool(ksize: i64, stride: i64) -> Result<Op> {
    Ok(Op::Pool(Pool::max(ksize, stride, Padding::Valid)?))
}

/// A chain of units applied to the block input.
#[derive(Debug)]
struct Branch {
    ops: Vec<Op>,
}

impl Branch {
    fn new(ops: Vec<Op>) -> Branch {
        Branch { ops }
    }

    fn out_channels(&self, c_in: i64) -> i64 {
        self.ops.iter().fold(c_in, |c, op| op.out_channels(c))
    }
}

impl ModuleT for Branch {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.ops.iter().fold(xs.shallow_clone(), |xs, op| op.forward_t(&xs, train))
    }
}

impl Layer for Branch {
    fn output_shape(&self, input: FeatureShape) -> Result<FeatureShape> {
        self.ops.iter().try_fold(input, |shape, op| op.output_shape(shape))
    }

    fn regularized(&self) -> Vec<&Tensor> {
        self.ops.iter().flat_map(|op| op.regularized()).collect()
    }
}

/// Runs every branch and checks that they agree on the spatial size.
fn branch_shapes(name: &str, branches: &[Branch], input: FeatureShape) -> Result<FeatureShape> {
    let mut output: Option<FeatureShape> = None;
    for (index, branch) in branches.iter().enumerate() {
        let shape = branch.output_shape(input)?;
        output = match output {
            None => Some(shape),
            Some(acc) if acc.spatial() == shape.spatial() => {
                Some(FeatureShape { channels: acc.channels + shape.channels, ..acc })
            }
            Some(acc) => {
                return Err(FaceEmbedError::Shape(format!(
                    "{name}: Branch_{index} produces {}x{} maps, previous branches {}x{}",
                    shape.height, shape.width, acc.height, acc.width
                )))
            }
        };
    }
    output.ok_or_else(|| FaceEmbedError::Shape(format!("{name} has no branch")))
}

fn concat_branches(branches: &[Branch], xs: &Tensor, train: bool) -> Tensor {
    let ys: Vec<Tensor> = branches.iter().map(|b| b.forward_t(xs, train)).collect();
    Tensor::cat(&ys, 1)
}

/// A multi-branch block whose concatenated output replaces its input.
#[derive(Debug)]
pub struct Mixed {
    name: String,
    branches: Vec<Branch>,
}

impl ModuleT for Mixed {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        concat_branches(&self.branches, xs, train)
    }
}

impl Layer for Mixed {
    fn output_shape(&self, input: FeatureShape) -> Result<FeatureShape> {
        branch_shapes(&self.name, &self.branches, input)
    }

    fn regularized(&self) -> Vec<&Tensor> {
        self.branches.iter().flat_map(|b| b.regularized()).collect()
    }
}

/// An Inception-ResNet block: the concatenated branches are projected back
/// onto the input channels, scaled and added to the input.
#[derive(Debug)]
pub struct ResidualBlock {
    name: String,
    branches: Vec<Branch>,
    up: ConvUnit,
    scale: f64,
    activation: Option<Activation>,
}

impl ResidualBlock {
    fn new(
        p: &Scope,
        c_in: i64,
        branches: Vec<Branch>,
        scale: f64,
        activation: Option<Activation>,
        projection: ConvUnitConfig,
    ) -> Result<ResidualBlock> {
        let mixed: i64 = branches.iter().map(|b| b.out_channels(c_in)).sum();
        let up = ConvUnit::new(&(p / "Conv2d_1x1"), mixed, c_in, [1, 1], projection)?;
        Ok(ResidualBlock { name: p.name().to_string(), branches, up, scale, activation })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let up = concat_branches(&self.branches, xs, train).apply_t(&self.up, train);
        let ys = xs + up * self.scale;
        match self.activation {
            Some(activation) => activation.apply(&ys),
            None => ys,
        }
    }
}

impl Layer for ResidualBlock {
    fn output_shape(&self, input: FeatureShape) -> Result<FeatureShape> {
        let mixed = branch_shapes(&self.name, &self.branches, input)?;
        let up = self.up.output_shape(mixed)?;
        if up != input {
            return Err(FaceEmbedError::Shape(format!(
                "{}: residual of shape {up:?} cannot be added to {input:?}",
                self.name
            )));
        }
        Ok(input)
    }

    fn regularized(&self) -> Vec<&Tensor> {
        self.branches.iter().flat_map(|b| b.regularized()).chain(self.up.regularized()).collect()
    }
}

/// The 35x35 block (Inception-ResNet-A).
pub fn block35(
    p: &Scope,
    c_in: i64,
    scale: f64,
    activation: Option<Activation>,
    config: &Config,
) -> Result<ResidualBlock> {
    let c = config.conv;
    let (b0, b1, b2) = (p / "Branch_0", p / "Branch_1", p / "Branch_2");
    let branches = vec![
        Branch::new(vec![conv(&b0 / "Conv2d_1x1", c_in, 32, 1, c)?]),
        Branch::new(vec![
            conv(&b1 / "Conv2d_0a_1x1", c_in, 32, 1, c)?,
            conv(&b1 / "Conv2d_0b_3x3", 32, 32, 3, c)?,
        ]),
        Branch::new(vec![
            conv(&b2 / "Conv2d_0a_1x1", c_in, 32, 1, c)?,
            conv(&b2 / "Conv2d_0b_3x3", 32, 48, 3, c)?,
            conv(&b2 / "Conv2d_0c_3x3", 48, 64, 3, c)?,
        ]),
    ];
    ResidualBlock::new(p, c_in, branches, scale, activation, config.projection)
}

/// The 17x17 block (Inception-ResNet-B).
pub fn block17(
    p: &Scope,
    c_in: i64,
    scale: f64,
    activation: Option<Activation>,
    config: &Config,
) -> Result<ResidualBlock> {
    let c = config.conv;
    let (b0, b1) = (p / "Branch_0", p / "Branch_1");
    let branches = vec![
        Branch::new(vec![conv(&b0 / "Conv2d_1x1", c_in, 192, 1, c)?]),
        Branch::new(vec![
            conv(&b1 / "Conv2d_0a_1x1", c_in, 128, 1, c)?,
            conv2(&b1 / "Conv2d_0b_1x7", 128, 160, [1, 7], c)?,
            conv2(&b1 / "Conv2d_0c_7x1", 160, 192, [7, 1], c)?,
        ]),
    ];
    ResidualBlock::new(p, c_in, branches, scale, activation, config.projection)
}

/// The 8x8 block (Inception-ResNet-C).
pub fn block8(
    p: &Scope,
    c_in: i64,
    scale: f64,
    activation: Option<Activation>,
    config: &Config,
) -> Result<ResidualBlock> {
    let c = config.conv;
    let (b0, b1) = (p / "Branch_0", p / "Branch_1");
    let branches = vec![
        Branch::new(vec![conv(&b0 / "Conv2d_1x1", c_in, 192, 1, c)?]),
        Branch::new(vec![
            conv(&b1 / "Conv2d_0a_1x1", c_in, 192, 1, c)?,
            conv2(&b1 / "Conv2d_0b_1x3", 192, 224, [1, 3], c)?,
            conv2(&b1 / "Conv2d_0c_3x1", 224, 256, [3, 1], c)?,
        ]),
    ];
    ResidualBlock::new(p, c_in, branches, scale, activation, config.projection)
}

/// 35x35 stem output to 35x35x320.
pub fn mixed_5b(p: &Scope, c_in: i64, config: &Config) -> Result<Mixed> {
    let c = config.conv;
    let (b0, b1, b2, b3) = (p / "Branch_0", p / "Branch_1", p / "Branch_2", p / "Branch_3");
    let branches = vec![
        Branch::new(vec![conv(&b0 / "Conv2d_1x1", c_in, 96, 1, c)?]),
        Branch::new(vec![
            conv(&b1 / "Conv2d_0a_1x1", c_in, 48, 1, c)?,
            conv(&b1 / "Conv2d_0b_5x5", 48, 64, 5, c)?,
        ]),
        Branch::new(vec![
            conv(&b2 / "Conv2d_0a_1x1", c_in, 64, 1, c)?,
            conv(&b2 / "Conv2d_0b_3x3", 64, 96, 3, c)?,
            conv(&b2 / "Conv2d_0c_3x3", 96, 96, 3, c)?,
        ]),
        Branch::new(vec![
            Op::Pool(Pool::avg(3, 1, Padding::Same)?),
            conv(&b3 / "Conv2d_0b_1x1", c_in, 64, 1, c)?,
        ]),
    ];
    Ok(Mixed { name: p.name().to_string(), branches })
}

/// 35x35 to 17x17x1088.
pub fn mixed_6a(p: &Scope, c_in: i64, config: &Config) -> Result<Mixed> {
    let c = config.conv;
    let reduce = c.stride(2).padding(Padding::Valid);
    let (b0, b1) = (p / "Branch_0", p / "Branch_1");
    let branches = vec![
        Branch::new(vec![conv(&b0 / "Conv2d_1a_3x3", c_in, 384, 3, reduce)?]),
        Branch::new(vec![
            conv(&b1 / "Conv2d_0a_1x1", c_in, 256, 1, c)?,
            conv(&b1 / "Conv2d_0b_3x3", 256, 256, 3, c)?,
            conv(&b1 / "Conv2d_1a_3x3", 256, 384, 3, reduce)?,
        ]),
        Branch::new(vec![max_pool(3, 2)?]),
    ];
    Ok(Mixed { name: p.name().to_string(), branches })
}

/// 17x17 to 8x8x2080.
pub fn mixed_7a(p: &Scope, c_in: i64, config: &Config) -> Result<Mixed> {
    let c = config.conv;
    let reduce = c.stride(2).padding(Padding::Valid);
    let (b0, b1, b2) = (p / "Branch_0", p / "Branch_1", p / "Branch_2");
    let branches = vec![
        Branch::new(vec![
            conv(&b0 / "Conv2d_0a_1x1", c_in, 256, 1, c)?,
            conv(&b0 / "Conv2d_1a_3x3", 256, 384, 3, reduce)?,
        ]),
        Branch::new(vec![
            conv(&b1 / "Conv2d_0a_1x1", c_in, 256, 1, c)?,
            conv(&b1 / "Conv2d_0b_3x3", 256, 288, 3, reduce)?,
        ]),
        Branch::new(vec![
            conv(&b2 / "Conv2d_0a_1x1", c_in, 256, 1, c)?,
            conv(&b2 / "Conv2d_0b_3x3", 256, 288, 3, c)?,
            conv(&b2 / "Conv2d_1a_3x3", 288, 320, 3, reduce)?,
        ]),
        Branch::new(vec![max_pool(3, 2)?]),
    ];
    Ok(Mixed { name: p.name().to_string(), branches })
}

type BlockFn = fn(&Scope, i64, f64, Option<Activation>, &Config) -> Result<ResidualBlock>;

fn repeat(
    p: &Scope,
    count: usize,
    block: BlockFn,
    prefix: &str,
    c_in: i64,
    scale: f64,
    config: &Config,
) -> Result<Vec<ResidualBlock>> {
    (1..=count)
        .map(|index| {
            block(&p.sub(&format!("{prefix}_{index}")), c_in, scale, Some(Activation::Relu), config)
        })
        .collect()
}

/// The embedding network.
///
/// Every block owns its variables; building the network twice on the same
/// path with `Reuse::Share` gives a second handle on the same weights.
#[derive(Debug)]
pub struct InceptionResnetV2 {
    config: Config,
    stem: Vec<Op>,
    mixed_5b: Mixed,
    repeat_35: Vec<ResidualBlock>,
    mixed_6a: Mixed,
    repeat_17: Vec<ResidualBlock>,
    mixed_7a: Mixed,
    repeat_8: Vec<ResidualBlock>,
    block8: ResidualBlock,
    bottleneck: FullyConnected,
}

impl InceptionResnetV2 {
    pub fn new(p: &nn::Path, config: Config, reuse: Reuse) -> Result<InceptionResnetV2> {
        if !(config.keep_prob > 0. && config.keep_prob <= 1.) {
            return Err(FaceEmbedError::Config(format!(
                "keep_prob must be in (0, 1], got {}",
                config.keep_prob
            )));
        }
        if config.bottleneck_size <= 0 {
            return Err(FaceEmbedError::Config(format!(
                "bottleneck_size must be positive, got {}",
                config.bottleneck_size
            )));
        }
        let p = Scope::new(p / "InceptionResnetV2", reuse);
        let c = config.conv;
        let valid = c.padding(Padding::Valid);
        let stem = vec![
            conv(&p / "Conv2d_1a_3x3", config.in_channels, 32, 3, valid.stride(2))?,
            conv(&p / "Conv2d_2a_3x3", 32, 32, 3, valid)?,
            conv(&p / "Conv2d_2b_3x3", 32, 64, 3, c)?,
            max_pool(3, 2)?,
            conv(&p / "Conv2d_3b_1x1", 64, 80, 1, valid)?,
            conv(&p / "Conv2d_4a_3x3", 80, 192, 3, valid)?,
            max_pool(3, 2)?,
        ];
        let mixed_5b = mixed_5b(&(&p / "Mixed_5b"), 192, &config)?;
        let (n35, s35) = (config.block35_repeats, config.block35_scale);
        let repeat_35 = repeat(&(&p / "Repeat"), n35, block35, "block35", 320, s35, &config)?;
        let mixed_6a = mixed_6a(&(&p / "Mixed_6a"), 320, &config)?;
        let (n17, s17) = (config.block17_repeats, config.block17_scale);
        let repeat_17 = repeat(&(&p / "Repeat_1"), n17, block17, "block17", 1088, s17, &config)?;
        let mixed_7a = mixed_7a(&(&p / "Mixed_7a"), 1088, &config)?;
        let (n8, s8) = (config.block8_repeats, config.block8_scale);
        let repeat_8 = repeat(&(&p / "Repeat_2"), n8, block8, "block8", 2080, s8, &config)?;
        let block8 = block8(&(&p / "Block8"), 2080, 1.0, None, &config)?;
        let bottleneck = FullyConnected::new(
            &(&p / "Bottleneck"),
            2080,
            config.bottleneck_size,
            config.bottleneck,
        )?;
        debug!("built InceptionResnetV2 ({reuse:?})");
        Ok(InceptionResnetV2 {
            config,
            stem,
            mixed_5b,
            repeat_35,
            mixed_6a,
            repeat_17,
            mixed_7a,
            repeat_8,
            block8,
            bottleneck,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedding_size(&self) -> i64 {
        self.config.bottleneck_size
    }

    /// The feature extractor, in evaluation order.
    fn layers(&self) -> Vec<&dyn Layer> {
        let mut layers: Vec<&dyn Layer> = self.stem.iter().map(|op| op as &dyn Layer).collect();
        layers.push(&self.mixed_5b);
        layers.extend(self.repeat_35.iter().map(|b| b as &dyn Layer));
        layers.push(&self.mixed_6a);
        layers.extend(self.repeat_17.iter().map(|b| b as &dyn Layer));
        layers.push(&self.mixed_7a);
        layers.extend(self.repeat_8.iter().map(|b| b as &dyn Layer));
        layers.push(&self.block8);
        layers
    }

    /// Shape of the last feature map for an input image of shape `input`,
    /// or a shape error if the image cannot go through the network.
    pub fn output_shape(&self, input: FeatureShape) -> Result<FeatureShape> {
        self.layers().into_iter().try_fold(input, |shape, layer| layer.output_shape(shape))
    }

    /// Embeds a `(batch, channels, height, width)` image batch after
    /// checking that it fits the network.
    pub fn embed(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let (_, c, h, w) = images.size4()?;
        let features = self.output_shape(FeatureShape::new(c, h, w))?;
        debug!("embedding {:?} through a {features:?} feature map", images.size());
        Ok(self.forward_t(images, train))
    }

    /// `weight_decay` times the L2 loss of every convolution and bottleneck
    /// weight and bias.
    pub fn regularization_loss(&self) -> Tensor {
        let device = self.bottleneck.weights.device();
        let zero = Tensor::from(0f32).to_device(device);
        if self.config.weight_decay == 0. {
            return zero;
        }
        let layers = self.layers();
        let weights =
            layers.iter().flat_map(|l| l.regularized()).chain(self.bottleneck.regularized());
        weights.fold(zero, |acc, w| acc + l2_loss(w)) * self.config.weight_decay
    }
}

impl ModuleT for InceptionResnetV2 {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.layers()
            .into_iter()
            .fold(xs.shallow_clone(), |xs, layer| layer.forward_t(&xs, train))
            .mean_dim(Some([2i64, 3].as_slice()), false, Kind::Float)
            .dropout(1. - self.config.keep_prob, train)
            .apply_t(&self.bottleneck, train)
    }
}

/// Builds the network under `p` and embeds `images`.
///
/// With `Reuse::Share` the variables created by an earlier call on the same
/// path are used, which is how several image batches go through one set of
/// weights.
pub fn inference(
    p: &nn::Path,
    images: &Tensor,
    keep_prob: f64,
    bottleneck_size: i64,
    phase_train: bool,
    weight_decay: f64,
    reuse: Reuse,
) -> Result<(Tensor, InceptionResnetV2)> {
    let config = Config { keep_prob, bottleneck_size, weight_decay, ..Default::default() };
    let net = InceptionResnetV2::new(p, config, reuse)?;
    let embeddings = net.embed(images, phase_train)?;
    Ok((embeddings, net))
}
