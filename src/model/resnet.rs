use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::{activation, backend::Backend, Int, Tensor};
use crate::config::ResNetConfig;

const CONV_BN_EPS: f64 = 2e-5;
const ZSCORE_EPS: f64 = 1e-3;

/// Convolution without bias followed by batch norm and an optional ReLU.
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
    with_relu: bool,
}

impl<B: Backend> ConvBn<B> {
    fn new(
        channels: [usize; 2],
        stride: usize,
        with_relu: bool,
        bn_momentum: f64,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new(channels, [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let bn = BatchNormConfig::new(channels[1])
            .with_epsilon(CONV_BN_EPS)
            .with_momentum(bn_momentum)
            .init(device);

        Self {
            conv,
            bn,
            with_relu,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.bn.forward(self.conv.forward(input));
        if self.with_relu {
            activation::relu(x)
        } else {
            x
        }
    }
}

/// Two 3x3 ConvBn layers with an identity or strided projection shortcut.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: ConvBn<B>,
    conv2: ConvBn<B>,
    proj: Option<Conv2d<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        dim_match: bool,
        bn_momentum: f64,
        device: &B::Device,
    ) -> Self {
        let stride = if dim_match { 1 } else { 2 };
        let conv1 = ConvBn::new([in_channels, out_channels], stride, true, bn_momentum, device);
        let conv2 = ConvBn::new([out_channels, out_channels], 1, false, bn_momentum, device);

        let proj = (!dim_match).then(|| {
            Conv2dConfig::new([in_channels, out_channels], [2, 2])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Valid)
                .with_bias(false)
                .init(device)
        });

        Self { conv1, conv2, proj }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = match &self.proj {
            Some(proj) => proj.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.conv2.forward(self.conv1.forward(input));
        activation::relu(shortcut + x)
    }

    pub fn is_projection(&self) -> bool {
        self.proj.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct ClassificationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub output: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    zscore: BatchNorm<B>,
    conv0: ConvBn<B>,
    blocks: Vec<ResidualBlock<B>>,
    pool: AvgPool2d,
    fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    /// `data_shape` must already be validated against `config`.
    pub fn new(config: &ResNetConfig, data_shape: [usize; 3], device: &B::Device) -> Self {
        let bn_momentum = config.burn_bn_momentum();

        let zscore = BatchNormConfig::new(config.in_channels)
            .with_epsilon(ZSCORE_EPS)
            .with_momentum(bn_momentum)
            .init(device);
        let conv0 = ConvBn::new(
            [config.in_channels, config.num_filter],
            1,
            true,
            bn_momentum,
            device,
        );

        let mut blocks = Vec::with_capacity(config.num_level * config.num_block);
        let mut channels = config.num_filter;
        for level in 0..config.num_level {
            let level_channels = config.num_filter << level;
            for block in 0..config.num_block {
                let dim_match = level == 0 || block > 0;
                blocks.push(ResidualBlock::new(
                    channels,
                    level_channels,
                    dim_match,
                    bn_momentum,
                    device,
                ));
                channels = level_channels;
            }
        }

        let pool = AvgPool2dConfig::new(config.pool_kernel)
            .with_strides(config.pool_stride)
            .with_padding(PaddingConfig2d::Valid)
            .init();
        let fc = LinearConfig::new(config.feature_dim(data_shape), config.num_classes).init(device);

        Self {
            zscore,
            conv0,
            blocks,
            pool,
            fc,
        }
    }

    /// Class logits of shape `[batch, num_classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.zscore.forward(images);
        let x = self.conv0.forward(x);
        let x = self
            .blocks
            .iter()
            .fold(x, |x, block| block.forward(x));
        let x = self.pool.forward(x);
        self.fc.forward(x.flatten::<2>(1, 3))
    }

    /// Softmax cross-entropy against `targets`, averaged over the batch.
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput {
            loss,
            output,
            targets,
        }
    }

    pub fn blocks(&self) -> &[ResidualBlock<B>] {
        &self.blocks
    }
}
