use anyhow::{Context, Result};
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::TrainConfig;
use crate::model::ResNet;

/// Metadata written next to the model weights of every checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Number of completed epochs.
    pub epoch: usize,
    pub config: TrainConfig,
    pub model_file: String,
    /// Optimizer state saved alongside the weights, if any.
    #[serde(default)]
    pub optimizer_file: Option<String>,
    pub timestamp: u64,
    pub val_accuracy: Option<f64>,
}

/// Save model weights and training progress after `epoch` completed epochs
pub fn save_checkpoint<B: Backend>(
    model: &ResNet<B>,
    epoch: usize,
    val_accuracy: Option<f64>,
    optimizer_file: Option<String>,
    config: &TrainConfig,
    checkpoint_dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(checkpoint_dir)
        .with_context(|| format!("Failed to create checkpoint directory: {:?}", checkpoint_dir))?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let checkpoint_name = format!("checkpoint_epoch_{}", epoch);
    let model_file = format!("{}_model", checkpoint_name);
    let model_path = checkpoint_dir.join(&model_file);

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    recorder
        .record(model.clone().into_record(), model_path.clone())
        .with_context(|| "Failed to save model weights")?;

    info!("Model weights saved to: {:?}", model_path);

    let checkpoint_data = CheckpointData {
        epoch,
        config: config.clone(),
        model_file,
        optimizer_file,
        timestamp,
        val_accuracy,
    };

    let metadata_path = checkpoint_dir.join(checkpoint_name).with_extension("json");
    let metadata_json = serde_json::to_string_pretty(&checkpoint_data)
        .with_context(|| "Failed to serialize checkpoint metadata")?;

    fs::write(&metadata_path, metadata_json)
        .with_context(|| format!("Failed to write checkpoint metadata: {:?}", metadata_path))?;

    info!("Checkpoint saved after epoch {}: {:?}", epoch, metadata_path);

    Ok(metadata_path)
}

/// Save optimizer state for the checkpoint after `epoch`, returning the file name for its metadata
pub fn save_optimizer_state<B: Backend, R: Record<B>>(
    record: R,
    epoch: usize,
    checkpoint_dir: &Path,
) -> Result<String> {
    fs::create_dir_all(checkpoint_dir)
        .with_context(|| format!("Failed to create checkpoint directory: {:?}", checkpoint_dir))?;

    let optimizer_file = format!("checkpoint_epoch_{}_optimizer", epoch);
    let optimizer_path = checkpoint_dir.join(&optimizer_file);

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    Recorder::<B>::record(&recorder, record, optimizer_path.clone())
        .with_context(|| "Failed to save optimizer state")?;

    info!("Optimizer state saved to: {:?}", optimizer_path);
    Ok(optimizer_file)
}

/// Load the optimizer state a checkpoint refers to; `None` for checkpoints saved without one
pub fn load_optimizer_state<B: Backend, R: Record<B>>(
    checkpoint_path: &Path,
    checkpoint_data: &CheckpointData,
    device: &B::Device,
) -> Result<Option<R>> {
    let Some(optimizer_file) = &checkpoint_data.optimizer_file else {
        return Ok(None);
    };

    let checkpoint_dir = checkpoint_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Invalid checkpoint path"))?;
    let optimizer_path = checkpoint_dir.join(optimizer_file);

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let record = Recorder::<B>::load(&recorder, optimizer_path.clone(), device)
        .with_context(|| format!("Failed to load optimizer state from: {:?}", optimizer_path))?;

    Ok(Some(record))
}

/// Rebuild the model described by a checkpoint and load its weights
pub fn load_checkpoint<B: Backend>(
    checkpoint_path: &Path,
    device: &B::Device,
) -> Result<(ResNet<B>, CheckpointData)> {
    let metadata_json = fs::read_to_string(checkpoint_path)
        .with_context(|| format!("Failed to read checkpoint file: {:?}", checkpoint_path))?;

    let checkpoint_data: CheckpointData = serde_json::from_str(&metadata_json)
        .with_context(|| "Failed to parse checkpoint metadata")?;

    checkpoint_data
        .config
        .validate()
        .with_context(|| "Checkpoint carries an invalid configuration")?;

    info!("Loading checkpoint from epoch {}", checkpoint_data.epoch);

    let checkpoint_dir = checkpoint_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Invalid checkpoint path"))?;
    let model_path = checkpoint_dir.join(&checkpoint_data.model_file);

    let config = &checkpoint_data.config;
    let model = ResNet::<B>::new(&config.model, config.train.data_shape, device);

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(model_path.clone(), device)
        .with_context(|| format!("Failed to load model weights from: {:?}", model_path))?;

    let model = model.load_record(record);

    info!("Model weights loaded successfully");

    Ok((model, checkpoint_data))
}

/// List `(metadata path, epoch, timestamp)` of every checkpoint, oldest epoch first
pub fn list_checkpoints(checkpoint_dir: &Path) -> Result<Vec<(PathBuf, usize, u64)>> {
    if !checkpoint_dir.exists() {
        warn!("Checkpoint directory does not exist: {:?}", checkpoint_dir);
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();

    for entry in WalkDir::new(checkpoint_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let Ok(metadata_json) = fs::read_to_string(path) else {
            continue;
        };
        match serde_json::from_str::<CheckpointData>(&metadata_json) {
            Ok(data) => checkpoints.push((path.to_path_buf(), data.epoch, data.timestamp)),
            Err(err) => warn!("Skipping unreadable checkpoint {:?}: {}", path, err),
        }
    }

    checkpoints.sort_by_key(|(_, epoch, _)| *epoch);

    Ok(checkpoints)
}

pub fn latest_checkpoint(checkpoint_dir: &Path) -> Result<Option<PathBuf>> {
    Ok(list_checkpoints(checkpoint_dir)?
        .pop()
        .map(|(path, _, _)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImageRecordConfig, ResNetConfig};
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> TrainConfig {
        TrainConfig {
            model: ResNetConfig {
                num_classes: 2,
                num_level: 2,
                num_block: 1,
                num_filter: 4,
                pool_kernel: [2, 2],
                pool_stride: [2, 2],
                ..ResNetConfig::default()
            },
            train: ImageRecordConfig::new("train.rec").with_data_shape([3, 8, 8]),
            val: None,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_list_empty_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoints = list_checkpoints(temp_dir.path()).unwrap();
        assert_eq!(checkpoints.len(), 0);
        assert!(latest_checkpoint(temp_dir.path()).unwrap().is_none());
    }

    #[test]
    fn metadata_without_optimizer_file_still_parses() {
        let json = serde_json::json!({
            "epoch": 3,
            "config": tiny_config(),
            "model_file": "checkpoint_epoch_3_model",
            "timestamp": 0,
            "val_accuracy": 0.25,
        });
        let data: CheckpointData = serde_json::from_value(json).unwrap();
        assert_eq!(data.epoch, 3);
        assert!(data.optimizer_file.is_none());

        let state: Option<Vec<u64>> =
            load_optimizer_state::<TestBackend, _>(Path::new("ckpt/x.json"), &data, &Default::default())
                .unwrap();
        assert!(state.is_none());
    }

    #[test]
    fn save_list_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config = tiny_config();
        let device = Default::default();
        let model = ResNet::<TestBackend>::new(&config.model, [3, 8, 8], &device);

        save_checkpoint(&model, 2, Some(0.5), None, &config, temp_dir.path()).unwrap();
        let latest = save_checkpoint(&model, 10, None, None, &config, temp_dir.path()).unwrap();
        // not a checkpoint
        fs::write(temp_dir.path().join("notes.json"), "{}").unwrap();

        let listed = list_checkpoints(temp_dir.path()).unwrap();
        let epochs: Vec<usize> = listed.iter().map(|(_, epoch, _)| *epoch).collect();
        assert_eq!(epochs, vec![2, 10]);
        assert_eq!(latest_checkpoint(temp_dir.path()).unwrap(), Some(latest.clone()));

        let (loaded, data) = load_checkpoint::<TestBackend>(&latest, &device).unwrap();
        assert_eq!(data.epoch, 10);
        assert_eq!(data.val_accuracy, None);
        assert_eq!(data.optimizer_file, None);
        assert_eq!(loaded.num_params(), model.num_params());

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let expected = model.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = loaded.forward(images).into_data().to_vec::<f32>().unwrap();
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-5);
        }
    }
}
