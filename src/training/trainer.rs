use anyhow::Result;
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::tensor::{backend::{AutodiffBackend, Backend}, ElementConversion, Int, Tensor};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::metric::Accuracy;
use crate::checkpoint::{load_optimizer_state, save_optimizer_state, CheckpointData};
use crate::config::{OptimizerConfig, TrainConfig};
use crate::data::DataLoader;
use crate::model::ResNet;

/// A batch of images `[N, C, H, W]` with their class indices `[N]`.
///
/// The last `pad` samples repeat earlier ones to fill a short tail batch.
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
    pub pad: usize,
}

impl<B: Backend> ImageBatch<B> {
    pub fn new(images: Tensor<B, 4>, labels: Tensor<B, 1, Int>, pad: usize) -> Self {
        Self {
            images,
            labels,
            pad,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_valid(&self) -> usize {
        self.len().saturating_sub(self.pad)
    }
}

#[derive(Clone, Debug)]
pub struct TrainOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub logits: Tensor<B, 2>,
    pub labels: Tensor<B, 1, Int>,
    pub step: usize,
}

#[derive(Clone, Debug)]
pub struct EpochSummary {
    pub epoch: usize,
    pub num_batches: usize,
    pub mean_loss: f32,
    pub train_accuracy: f64,
    pub val_accuracy: Option<f64>,
    pub elapsed: Duration,
}

/// SGD with momentum, L2 weight decay and element-wise gradient clipping.
///
/// The loss is already a batch mean, so no extra `1 / batch_size` rescale is applied.
pub fn sgd_config(config: &OptimizerConfig) -> SgdConfig {
    let momentum = MomentumConfig::new()
        .with_momentum(config.momentum)
        .with_dampening(0.0)
        .with_nesterov(false);
    let weight_decay = (config.weight_decay > 0.0).then(|| WeightDecayConfig::new(config.weight_decay));

    SgdConfig::new()
        .with_weight_decay(weight_decay)
        .with_momentum((config.momentum > 0.0).then_some(momentum))
        .with_gradient_clipping(config.clip().map(GradientClippingConfig::Value))
}

/// Classification accuracy of `model` over one full pass of `loader`.
pub fn evaluate<B: Backend, L: DataLoader<B>>(model: &ResNet<B>, loader: &mut L) -> Result<Accuracy> {
    let mut accuracy = Accuracy::new();
    loader.reset();
    while let Some(batch) = loader.next_batch()? {
        let valid = batch.num_valid();
        if valid == 0 {
            continue;
        }
        let logits = model.forward(batch.images).narrow(0, 0, valid);
        accuracy.update(batch.labels.narrow(0, 0, valid), logits);
    }
    Ok(accuracy)
}

pub struct ResNetTrainer<B: AutodiffBackend> {
    model: ResNet<B>,
    optimizer: OptimizerAdaptor<Sgd<B::InnerBackend>, ResNet<B>, B>,
    config: TrainConfig,
    step: usize,
    epoch: usize,
}

impl<B: AutodiffBackend> ResNetTrainer<B> {
    pub fn new(model: ResNet<B>, config: TrainConfig) -> Self {
        let optimizer = sgd_config(&config.optimizer).init::<B, ResNet<B>>();

        Self {
            model,
            optimizer,
            config,
            step: 0,
            epoch: 0,
        }
    }

    /// Continue counting from `epoch` completed epochs, e.g. after loading a checkpoint.
    pub fn with_start_epoch(mut self, epoch: usize) -> Self {
        self.epoch = epoch;
        self
    }

    /// Restore the momentum buffers saved with a checkpoint.
    pub fn with_optimizer_state(
        mut self,
        checkpoint_path: &Path,
        checkpoint_data: &CheckpointData,
        device: &B::Device,
    ) -> Result<Self> {
        match load_optimizer_state::<B, _>(checkpoint_path, checkpoint_data, device)? {
            Some(record) => {
                self.optimizer = self.optimizer.load_record(record);
                info!("Optimizer state restored from epoch {}", checkpoint_data.epoch);
            }
            None => warn!("Checkpoint has no optimizer state; momentum restarts from zero"),
        }
        Ok(self)
    }

    pub fn train_step(&mut self, batch: ImageBatch<B>) -> TrainOutput<B> {
        let output = self.model.forward_classification(batch.images, batch.labels);

        let grads = GradientsParams::from_grads(output.loss.backward(), &self.model);
        let lr = self.config.optimizer.learning_rate;
        self.model = self.optimizer.step(lr, self.model.clone(), grads);
        self.step += 1;

        TrainOutput {
            loss: output.loss,
            logits: output.output,
            labels: output.targets,
            step: self.step,
        }
    }

    /// One pass over `loader`, which is reset first.
    pub fn train_epoch<L: DataLoader<B>>(&mut self, loader: &mut L) -> Result<EpochSummary> {
        let start = Instant::now();
        let mut total_loss = 0.0;
        let mut num_batches = 0;
        let mut accuracy = Accuracy::new();
        let expected = loader.num_batches();

        loader.reset();
        while let Some(batch) = loader.next_batch()? {
            let output = self.train_step(batch);
            let loss_value = output.loss.into_scalar().elem::<f32>();
            accuracy.update(output.labels, output.logits);
            total_loss += loss_value;
            num_batches += 1;

            if num_batches % self.config.log_every == 0 {
                info!(
                    "Batch {}/{}: loss = {:.6} (avg: {:.6}), train accuracy = {:.4}",
                    num_batches,
                    expected.map_or_else(|| "?".to_string(), |n| n.to_string()),
                    loss_value,
                    total_loss / num_batches as f32,
                    accuracy.get()
                );
            }
        }

        let mean_loss = if num_batches > 0 {
            total_loss / num_batches as f32
        } else {
            0.0
        };

        Ok(EpochSummary {
            epoch: self.epoch,
            num_batches,
            mean_loss,
            train_accuracy: accuracy.get(),
            val_accuracy: None,
            elapsed: start.elapsed(),
        })
    }

    /// Accuracy of the current weights with batch norm in inference mode.
    pub fn validate<L: DataLoader<B::InnerBackend>>(&self, loader: &mut L) -> Result<Accuracy> {
        let model = self.model.valid();
        evaluate(&model, loader)
    }

    /// Train until `num_epochs` epochs are complete, validating after each.
    pub fn fit<T, V>(&mut self, train: &mut T, mut val: Option<&mut V>) -> Result<Vec<EpochSummary>>
    where
        T: DataLoader<B>,
        V: DataLoader<B::InnerBackend>,
    {
        let mut summaries = Vec::new();

        while self.epoch < self.config.num_epochs {
            info!("Epoch: {}", self.epoch);
            let mut summary = self.train_epoch(train)?;
            self.epoch += 1;

            if let Some(loader) = val.as_deref_mut() {
                let accuracy = self.validate(loader)?;
                info!("Accuracy: {}", accuracy.get());
                debug!("Validation: {}", accuracy);
                summary.val_accuracy = Some(accuracy.get());
            }

            info!(
                "Epoch {} done in {:.1}s: mean loss = {:.6}, train accuracy = {:.4}",
                summary.epoch,
                summary.elapsed.as_secs_f64(),
                summary.mean_loss,
                summary.train_accuracy
            );

            if let Some(dir) = self.config.checkpoint_dir.clone() {
                let last = self.epoch == self.config.num_epochs;
                if self.epoch % self.config.checkpoint_every == 0 || last {
                    self.save_checkpoint(summary.val_accuracy, &dir)?;
                }
            }

            summaries.push(summary);
        }

        Ok(summaries)
    }

    /// Save weights and optimizer state after the completed epochs.
    pub fn save_checkpoint(&self, val_accuracy: Option<f64>, dir: &Path) -> Result<PathBuf> {
        let optimizer_file = save_optimizer_state::<B, _>(self.optimizer.to_record(), self.epoch, dir)?;
        crate::checkpoint::save_checkpoint(
            &self.model,
            self.epoch,
            val_accuracy,
            Some(optimizer_file),
            &self.config,
            dir,
        )
    }

    pub fn model(&self) -> &ResNet<B> {
        &self.model
    }

    pub fn into_model(self) -> ResNet<B> {
        self.model
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}
