// Library exports for use in the binaries and tests

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod model;
pub mod training;

// Re-export commonly used types
pub use config::{ImageRecordConfig, OptimizerConfig, ResNetConfig, TrainConfig};
pub use model::ResNet;
pub use training::{Accuracy, ImageBatch, ResNetTrainer};
