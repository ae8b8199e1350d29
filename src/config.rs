use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    NotPositive { field: &'static str },
    #[error("{field} must be >= 0")]
    Negative { field: &'static str },
    #[error("{field} must be within [0, 1), got {value}")]
    OutOfUnitRange { field: &'static str, value: f64 },
    #[error("data_shape has {got} channels but the model expects {expected}")]
    ChannelMismatch { expected: usize, got: usize },
    #[error("image size {height}x{width} must be divisible by {factor} for {num_level} levels")]
    IndivisibleShape {
        height: usize,
        width: usize,
        factor: usize,
        num_level: usize,
    },
    #[error("validation data_shape {val:?} differs from training data_shape {train:?}")]
    ShapeMismatch { train: [usize; 3], val: [usize; 3] },
    #[error("{field} is too large")]
    TooLarge { field: &'static str },
    #[error("pool kernel {kernel:?} is larger than the {height}x{width} feature map")]
    PoolTooLarge {
        kernel: [usize; 2],
        height: usize,
        width: usize,
    },
}

fn positive(value: usize, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { field });
    }
    Ok(())
}

fn unit_range(value: f64, field: &'static str) -> Result<(), ConfigError> {
    if !(0.0..1.0).contains(&value) {
        return Err(ConfigError::OutOfUnitRange { field, value });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResNetConfig {
    pub num_classes: usize,
    pub in_channels: usize,
    pub num_level: usize,
    pub num_block: usize,
    pub num_filter: usize,
    /// Weight kept on the running statistics at each BatchNorm update.
    pub bn_momentum: f64,
    pub pool_kernel: [usize; 2],
    pub pool_stride: [usize; 2],
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            in_channels: 3,
            num_level: 3,
            num_block: 9,
            num_filter: 16,
            bn_momentum: 0.9,
            pool_kernel: [8, 8],
            pool_stride: [1, 1],
        }
    }
}

impl ResNetConfig {
    pub fn validate(&self, data_shape: [usize; 3]) -> Result<(), ConfigError> {
        positive(self.num_classes, "num_classes")?;
        positive(self.in_channels, "in_channels")?;
        positive(self.num_level, "num_level")?;
        positive(self.num_block, "num_block")?;
        positive(self.num_filter, "num_filter")?;
        for (kernel, stride) in self.pool_kernel.iter().zip(&self.pool_stride) {
            positive(*kernel, "pool_kernel")?;
            positive(*stride, "pool_stride")?;
        }
        unit_range(self.bn_momentum, "bn_momentum")?;
        if self.num_level >= usize::BITS as usize {
            return Err(ConfigError::TooLarge { field: "num_level" });
        }
        if self.num_filter.checked_mul(self.downsample_factor()).is_none() {
            return Err(ConfigError::TooLarge { field: "num_filter" });
        }

        let [channels, height, width] = data_shape;
        if channels != self.in_channels {
            return Err(ConfigError::ChannelMismatch {
                expected: self.in_channels,
                got: channels,
            });
        }

        let factor = self.downsample_factor();
        if height == 0 || width == 0 || height % factor != 0 || width % factor != 0 {
            return Err(ConfigError::IndivisibleShape {
                height,
                width,
                factor,
                num_level: self.num_level,
            });
        }

        let (fh, fw) = (height / factor, width / factor);
        if self.pool_kernel[0] > fh || self.pool_kernel[1] > fw {
            return Err(ConfigError::PoolTooLarge {
                kernel: self.pool_kernel,
                height: fh,
                width: fw,
            });
        }

        let ph = (fh - self.pool_kernel[0]) / self.pool_stride[0] + 1;
        let pw = (fw - self.pool_kernel[1]) / self.pool_stride[1] + 1;
        self.body_channels()
            .checked_mul(ph)
            .and_then(|n| n.checked_mul(pw))
            .ok_or(ConfigError::TooLarge { field: "data_shape" })?;

        Ok(())
    }

    /// Spatial reduction applied by the residual body. `num_level` must be below `usize::BITS`.
    pub fn downsample_factor(&self) -> usize {
        1 << (self.num_level.saturating_sub(1))
    }

    /// Channels produced by the last level.
    pub fn body_channels(&self) -> usize {
        self.num_filter * self.downsample_factor()
    }

    /// Width of the flattened pooled features fed to the classifier.
    pub fn feature_dim(&self, data_shape: [usize; 3]) -> usize {
        let factor = self.downsample_factor();
        let (fh, fw) = (data_shape[1] / factor, data_shape[2] / factor);
        let ph = (fh - self.pool_kernel[0]) / self.pool_stride[0] + 1;
        let pw = (fw - self.pool_kernel[1]) / self.pool_stride[1] + 1;
        self.body_channels() * ph * pw
    }

    /// burn weights the new batch statistic instead of the running one.
    pub fn burn_bn_momentum(&self) -> f64 {
        1.0 - self.bn_momentum
    }
}

impl fmt::Display for ResNetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resnet(classes={}, levels={}, blocks={}, filters={})",
            self.num_classes, self.num_level, self.num_block, self.num_filter
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRecordConfig {
    pub path_imgrec: PathBuf,
    pub path_imglist: Option<PathBuf>,
    /// `[channels, height, width]`
    pub data_shape: [usize; 3],
    pub shuffle: bool,
    pub round_batch: bool,
    pub mean_rgb: [f32; 3],
    pub scale: f32,
    pub label_width: usize,
}

impl Default for ImageRecordConfig {
    fn default() -> Self {
        Self {
            path_imgrec: PathBuf::new(),
            path_imglist: None,
            data_shape: [3, 256, 256],
            shuffle: false,
            round_batch: true,
            mean_rgb: [0.0; 3],
            scale: 1.0,
            label_width: 1,
        }
    }
}

impl ImageRecordConfig {
    pub fn new(path_imgrec: impl Into<PathBuf>) -> Self {
        Self {
            path_imgrec: path_imgrec.into(),
            ..Self::default()
        }
    }

    pub fn with_imglist(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_imglist = Some(path.into());
        self
    }

    pub fn with_data_shape(mut self, data_shape: [usize; 3]) -> Self {
        self.data_shape = data_shape;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_round_batch(mut self, round_batch: bool) -> Self {
        self.round_batch = round_batch;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let [channels, height, width] = self.data_shape;
        positive(channels, "data_shape channels")?;
        positive(height, "data_shape height")?;
        positive(width, "data_shape width")?;
        positive(self.label_width, "label_width")?;
        if !(self.scale > 0.0) {
            return Err(ConfigError::NotPositive { field: "scale" });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub weight_decay: f32,
    pub momentum: f64,
    /// Element-wise gradient clip; `None` or non-positive disables it.
    pub clip_gradient: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            weight_decay: 1e-4,
            momentum: 0.9,
            clip_gradient: Some(10.0),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.learning_rate > 0.0) {
            return Err(ConfigError::NotPositive {
                field: "learning_rate",
            });
        }
        if !(self.weight_decay >= 0.0) {
            return Err(ConfigError::Negative {
                field: "weight_decay",
            });
        }
        unit_range(self.momentum, "momentum")
    }

    pub fn clip(&self) -> Option<f32> {
        self.clip_gradient.filter(|c| *c > 0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub model: ResNetConfig,
    pub train: ImageRecordConfig,
    pub val: Option<ImageRecordConfig>,
    pub optimizer: OptimizerConfig,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub log_every: usize,
    pub seed: u64,
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpoint_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: ResNetConfig::default(),
            train: ImageRecordConfig::new("./sf1_train.rec")
                .with_imglist("./sf1_train.lst")
                .with_shuffle(true),
            val: Some(ImageRecordConfig::new("./sf1_val.rec").with_imglist("./sf1_val.lst")),
            optimizer: OptimizerConfig::default(),
            batch_size: 50,
            num_epochs: 100,
            log_every: 20,
            seed: 42,
            checkpoint_dir: None,
            checkpoint_every: 1,
        }
    }
}

impl TrainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: TrainConfig =
            serde_json::from_str(&config_str).with_context(|| "Failed to parse config JSON")?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(self.batch_size, "batch_size")?;
        positive(self.num_epochs, "num_epochs")?;
        positive(self.log_every, "log_every")?;
        positive(self.checkpoint_every, "checkpoint_every")?;
        self.optimizer.validate()?;
        self.train.validate()?;
        self.model.validate(self.train.data_shape)?;
        if let Some(val) = &self.val {
            val.validate()?;
            self.model.validate(val.data_shape)?;
            if val.data_shape != self.train.data_shape {
                return Err(ConfigError::ShapeMismatch {
                    train: self.train.data_shape,
                    val: val.data_shape,
                });
            }
        }
        Ok(())
    }
}
