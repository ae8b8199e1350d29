use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::module::Module;
use burn::tensor::backend::AutodiffBackend;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use resnet_record::checkpoint::load_checkpoint;
use resnet_record::config::{ImageRecordConfig, TrainConfig};
use resnet_record::data::{ImageRecord, ImageRecordLoader, RecordReader};
use resnet_record::model::ResNet;
use resnet_record::training::{evaluate, ResNetTrainer};

#[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
type Backend = Autodiff<burn_ndarray::NdArray<f32>>;
#[cfg(feature = "wgpu-backend")]
type Backend = Autodiff<burn_wgpu::Wgpu>;
#[cfg(all(feature = "tch-backend", not(feature = "wgpu-backend")))]
type Backend = Autodiff<burn_tch::LibTorch>;

type InnerBackend = <Backend as AutodiffBackend>::InnerBackend;

#[derive(Debug, Parser)]
#[command(author, version, about = "Train and validate a ResNet classifier on image record files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train the model, validating after every epoch
    Train(TrainArgs),
    /// Measure the accuracy of a checkpoint on a record file
    Eval(EvalArgs),
    /// Print the headers of the first records in a record file
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
struct TrainArgs {
    /// Path to configuration JSON file (built-in defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the number of epochs
    #[arg(long)]
    epochs: Option<usize>,
    /// Override the batch size
    #[arg(long)]
    batch_size: Option<usize>,
    /// Override the checkpoint directory
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    /// Resume from a checkpoint metadata file
    #[arg(long)]
    resume: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct EvalArgs {
    /// Path to checkpoint metadata JSON
    #[arg(long)]
    checkpoint: PathBuf,
    /// Path to the `.rec` file to evaluate on
    #[arg(long)]
    imgrec: PathBuf,
    /// Optional `.lst` file providing the labels
    #[arg(long)]
    imglist: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Debug, Args)]
struct InspectArgs {
    /// Path to the `.rec` file
    #[arg(long)]
    imgrec: PathBuf,
    /// Number of records to print
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train_command(args),
        Commands::Eval(args) => eval_command(args),
        Commands::Inspect(args) => inspect_command(args),
    }
}

fn train_command(args: TrainArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {:?}", path);
            TrainConfig::load(path)?
        }
        None => {
            info!("No configuration given, using defaults");
            TrainConfig::default()
        }
    };

    if let Some(epochs) = args.epochs {
        config.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.checkpoint_dir.is_some() {
        config.checkpoint_dir = args.checkpoint_dir.clone();
    }

    config
        .validate()
        .with_context(|| "Invalid configuration after applying overrides")?;

    let device: <Backend as burn::tensor::backend::Backend>::Device = Default::default();

    let (model, resume) = match &args.resume {
        Some(path) => {
            let (model, data) = load_checkpoint::<Backend>(path, &device)?;
            // hyperparameters and data paths stay as configured; only the architecture must match
            if data.config.model != config.model
                || data.config.train.data_shape != config.train.data_shape
            {
                warn!("Checkpoint architecture differs from the configuration; using the checkpoint's");
                config.model = data.config.model.clone();
                config.train.data_shape = data.config.train.data_shape;
                if let Some(val) = config.val.as_mut() {
                    val.data_shape = data.config.train.data_shape;
                }
            }
            info!("Resuming after epoch {}", data.epoch);
            (model, Some((path.clone(), data)))
        }
        None => (
            ResNet::<Backend>::new(&config.model, config.train.data_shape, &device),
            None,
        ),
    };

    if args.resume.is_some() {
        config
            .validate()
            .with_context(|| "Configuration does not fit the resumed checkpoint")?;
    }

    info!("Model: {} ({} parameters)", config.model, model.num_params());
    info!(
        "Optimizer: sgd lr={} wd={} momentum={} clip={:?}",
        config.optimizer.learning_rate,
        config.optimizer.weight_decay,
        config.optimizer.momentum,
        config.optimizer.clip()
    );

    let mut train_loader = ImageRecordLoader::<Backend>::new(
        config.train.clone(),
        config.batch_size,
        config.seed,
        device.clone(),
    )?
    .with_num_classes(config.model.num_classes);

    let mut val_loader = match &config.val {
        Some(val) => Some(
            ImageRecordLoader::<InnerBackend>::new(
                val.clone(),
                config.batch_size,
                config.seed,
                device.clone(),
            )?
            .with_num_classes(config.model.num_classes),
        ),
        None => {
            warn!("No validation data configured; accuracy will not be reported");
            None
        }
    };

    let num_epochs = config.num_epochs;
    let mut trainer = ResNetTrainer::new(model, config);
    if let Some((path, data)) = &resume {
        trainer = trainer
            .with_start_epoch(data.epoch)
            .with_optimizer_state(path, data, &device)?;
    }

    info!("Starting training for {} epochs...", num_epochs);
    let summaries = trainer.fit(&mut train_loader, val_loader.as_mut())?;

    if let Some(last) = summaries.last() {
        match last.val_accuracy {
            Some(acc) => info!("Final validation accuracy: {:.4}", acc),
            None => info!("Final mean training loss: {:.6}", last.mean_loss),
        }
    }

    info!("Training completed!");
    Ok(())
}

fn eval_command(args: EvalArgs) -> Result<()> {
    let device: <InnerBackend as burn::tensor::backend::Backend>::Device = Default::default();
    let (model, data) = load_checkpoint::<InnerBackend>(&args.checkpoint, &device)?;

    let template = data.config.val.clone().unwrap_or_else(|| data.config.train.clone());
    let record_config = ImageRecordConfig {
        path_imgrec: args.imgrec.clone(),
        path_imglist: args.imglist.clone(),
        shuffle: false,
        ..template
    };
    let batch_size = args.batch_size.unwrap_or(data.config.batch_size);

    let mut loader =
        ImageRecordLoader::<InnerBackend>::new(record_config, batch_size, data.config.seed, device)?
            .with_num_classes(data.config.model.num_classes);

    let accuracy = evaluate(&model, &mut loader)?;
    info!("Checkpoint from epoch {} on {:?}", data.epoch, args.imgrec);
    info!("Accuracy: {}", accuracy);
    Ok(())
}

fn inspect_command(args: InspectArgs) -> Result<()> {
    let reader = RecordReader::open(&args.imgrec)
        .with_context(|| format!("Failed to open record file: {:?}", args.imgrec))?;

    let mut shown = 0;
    for (idx, record) in reader.enumerate().take(args.limit) {
        let bytes = record.with_context(|| format!("Failed to read record {}", idx))?;
        let record = ImageRecord::parse(&bytes)
            .with_context(|| format!("Record {} is not an image record", idx))?;

        let size = image::load_from_memory(&record.image)
            .map(|img| format!("{}x{}", img.width(), img.height()))
            .unwrap_or_else(|err| format!("undecodable ({})", err));

        info!(
            "#{} id={} labels={:?} image={} bytes ({})",
            idx,
            record.header.id,
            record.labels,
            record.image.len(),
            size
        );
        shown += 1;
    }

    info!("Inspected {} record(s) from {:?}", shown, args.imgrec);
    Ok(())
}
