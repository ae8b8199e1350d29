pub mod metric;
pub mod trainer;

pub use metric::Accuracy;
pub use trainer::{evaluate, sgd_config, EpochSummary, ImageBatch, ResNetTrainer, TrainOutput};
