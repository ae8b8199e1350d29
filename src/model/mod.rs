pub mod resnet;

pub use resnet::{ClassificationOutput, ConvBn, ResNet, ResidualBlock};
