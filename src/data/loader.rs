use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Distribution, Int, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::File;
use std::io::BufReader;
use tracing::{debug, info};

use super::image_record::{decode_image, ImageRecord, Normalize};
use super::imglist::ImageList;
use super::recordio::{scan_offsets, RecordReader};
use crate::config::ImageRecordConfig;
use crate::training::ImageBatch;

/// Trait for data loading
pub trait DataLoader<B: Backend> {
    /// Get the next batch of data
    fn next_batch(&mut self) -> Result<Option<ImageBatch<B>>>;

    /// Reset the data loader to the beginning
    fn reset(&mut self);

    /// Get the total number of batches (if known)
    fn num_batches(&self) -> Option<usize>;
}

/// Streams labeled image batches out of a `.rec` file, optionally taking
/// labels from the matching `.lst`.
pub struct ImageRecordLoader<B: Backend> {
    config: ImageRecordConfig,
    reader: RecordReader<BufReader<File>>,
    offsets: Vec<u64>,
    order: Vec<usize>,
    imglist: Option<ImageList>,
    batch_size: usize,
    cursor: usize,
    seed: u64,
    epoch: u64,
    num_classes: Option<usize>,
    device: B::Device,
}

impl<B: Backend> ImageRecordLoader<B> {
    pub fn new(
        config: ImageRecordConfig,
        batch_size: usize,
        seed: u64,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;
        if batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }

        let offsets = scan_offsets(&config.path_imgrec)
            .with_context(|| format!("Failed to index record file: {:?}", config.path_imgrec))?;
        if offsets.is_empty() {
            anyhow::bail!("Record file contains no records: {:?}", config.path_imgrec);
        }

        let imglist = match &config.path_imglist {
            Some(path) => Some(ImageList::load(path, config.label_width)?),
            None => None,
        };

        let reader = RecordReader::open(&config.path_imgrec)
            .with_context(|| format!("Failed to open record file: {:?}", config.path_imgrec))?;

        info!(
            "Indexed {} records from {:?} (batch_size={}, shuffle={})",
            offsets.len(),
            config.path_imgrec,
            batch_size,
            config.shuffle
        );

        let order = (0..offsets.len()).collect();

        Ok(Self {
            config,
            reader,
            offsets,
            order,
            imglist,
            batch_size,
            cursor: 0,
            seed,
            epoch: 0,
            num_classes: None,
            device,
        })
    }

    /// Reject labels outside `0..num_classes` instead of passing them to the loss.
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }

    pub fn num_records(&self) -> usize {
        self.offsets.len()
    }

    fn read_sample(&mut self, position: usize) -> Result<(Vec<f32>, i64)> {
        let offset = self.offsets[position];
        self.reader.seek(offset)?;
        let bytes = self
            .reader
            .next_record()?
            .with_context(|| format!("Record {} vanished at offset {}", position, offset))?;
        let record = ImageRecord::parse(&bytes)
            .with_context(|| format!("Malformed image record at offset {}", offset))?;

        let label = match &self.imglist {
            Some(list) => list
                .labels(record.header.id)
                .and_then(|labels| labels.first().copied())
                .with_context(|| {
                    format!("Image id {} is missing from the image list", record.header.id)
                })?,
            None => record.label(),
        };
        let label = self.class_index(label, record.header.id)?;

        let normalize = Normalize {
            mean_rgb: self.config.mean_rgb,
            scale: self.config.scale,
        };
        let pixels = decode_image(&record.image, self.config.data_shape, normalize)
            .with_context(|| format!("Failed to decode image id {}", record.header.id))?;

        Ok((pixels, label))
    }

    fn class_index(&self, label: f32, id: u64) -> Result<i64> {
        if !label.is_finite() || label < 0.0 || label.fract() != 0.0 {
            anyhow::bail!("Image id {} has invalid class label {}", id, label);
        }
        let class = label as i64;
        if let Some(num_classes) = self.num_classes {
            if class as usize >= num_classes {
                anyhow::bail!(
                    "Image id {} has label {} but the model has {} classes",
                    id,
                    class,
                    num_classes
                );
            }
        }
        Ok(class)
    }
}

impl<B: Backend> DataLoader<B> for ImageRecordLoader<B> {
    fn next_batch(&mut self) -> Result<Option<ImageBatch<B>>> {
        let total = self.order.len();
        if self.cursor >= total {
            return Ok(None);
        }

        let take = self.batch_size.min(total - self.cursor);
        let mut positions = self.order[self.cursor..self.cursor + take].to_vec();
        self.cursor += take;

        // Fill the tail batch by wrapping around to the start of the epoch.
        let mut pad = 0;
        if take < self.batch_size && self.config.round_batch {
            pad = self.batch_size - take;
            positions.extend((0..pad).map(|i| self.order[i % total]));
        }

        let [channels, height, width] = self.config.data_shape;
        let mut pixels = Vec::with_capacity(positions.len() * channels * height * width);
        let mut labels = Vec::with_capacity(positions.len());
        for position in positions {
            let (sample, label) = self.read_sample(position)?;
            pixels.extend(sample);
            labels.push(label);
        }

        let batch = labels.len();
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch, channels, height, width]).convert::<B::FloatElem>(),
            &self.device,
        );
        let labels = Tensor::<B, 1, Int>::from_data(
            TensorData::new(labels, [batch]).convert::<B::IntElem>(),
            &self.device,
        );

        debug!("Loaded batch of {} ({} padded)", batch, pad);
        Ok(Some(ImageBatch::new(images, labels, pad)))
    }

    fn reset(&mut self) {
        self.cursor = 0;
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            self.order.shuffle(&mut rng);
        }
        self.epoch += 1;
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.order.len().div_ceil(self.batch_size))
    }
}

/// Synthetic image batches for smoke tests
pub struct RandomDataLoader<B: Backend> {
    batch_size: usize,
    data_shape: [usize; 3],
    num_classes: usize,
    num_batches: usize,
    current_batch: usize,
    device: B::Device,
}

impl<B: Backend> RandomDataLoader<B> {
    pub fn new(
        batch_size: usize,
        data_shape: [usize; 3],
        num_classes: usize,
        num_batches: usize,
        device: B::Device,
    ) -> Self {
        Self {
            batch_size,
            data_shape,
            num_classes,
            num_batches,
            current_batch: 0,
            device,
        }
    }
}

impl<B: Backend> DataLoader<B> for RandomDataLoader<B> {
    fn next_batch(&mut self) -> Result<Option<ImageBatch<B>>> {
        if self.current_batch >= self.num_batches {
            return Ok(None);
        }
        self.current_batch += 1;

        let [channels, height, width] = self.data_shape;
        let images = Tensor::<B, 4>::random(
            [self.batch_size, channels, height, width],
            Distribution::Default,
            &self.device,
        );
        let labels = Tensor::<B, 1, Int>::arange(0..self.batch_size as i64, &self.device)
            .remainder_scalar(self.num_classes as i64);

        Ok(Some(ImageBatch::new(images, labels, 0)))
    }

    fn reset(&mut self) {
        self.current_batch = 0;
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.num_batches)
    }
}
