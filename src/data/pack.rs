use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use super::image_record::{encode_image, Encoding, ImageRecord};
use super::imglist::{ImageList, ImageListEntry};
use super::recordio::RecordWriter;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tiff"];

#[derive(Debug, Clone, Copy)]
pub struct PackOptions {
    /// Shorter edge after resizing; 0 keeps the original size.
    pub resize: u32,
    pub encoding: Encoding,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            resize: 0,
            encoding: Encoding::Jpeg(95),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackSummary {
    pub rec_path: PathBuf,
    pub lst_path: PathBuf,
    pub packed: usize,
    pub skipped: usize,
}

/// Image paths with their class index, classes numbered by sorted directory name.
pub fn collect_images(root: &Path) -> Result<Vec<(PathBuf, usize)>> {
    let mut classes: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("Failed to read input directory: {:?}", root))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    classes.sort();

    let mut images = Vec::new();
    for (label, class_dir) in classes.iter().enumerate() {
        info!("Class {}: {:?}", label, class_dir.file_name().unwrap_or_default());

        let mut class_images: Vec<PathBuf> = WalkDir::new(class_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| is_image(p))
            .collect();
        class_images.sort();

        images.extend(class_images.into_iter().map(|p| (p, label)));
    }

    Ok(images)
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// `<prefix><suffix>`, keeping any dots already in the prefix.
pub fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Scale so the shorter edge is `edge` pixels, keeping the aspect ratio.
pub fn resize_shorter_edge(img: DynamicImage, edge: u32) -> DynamicImage {
    if edge == 0 {
        return img;
    }
    let (w, h) = (img.width() as u64, img.height() as u64);
    let (nw, nh) = if w < h {
        (edge as u64, h * edge as u64 / w)
    } else {
        (w * edge as u64 / h, edge as u64)
    };
    let clamp = |v: u64| v.clamp(1, u32::MAX as u64) as u32;
    img.resize_exact(clamp(nw), clamp(nh), FilterType::Triangle)
}

pub fn load_and_encode(path: &Path, options: &PackOptions) -> Result<Vec<u8>> {
    let img = image::open(path).with_context(|| format!("Failed to open image: {:?}", path))?;
    let img = resize_shorter_edge(img, options.resize);
    Ok(encode_image(&img, options.encoding)?)
}

/// Write `<prefix>.rec` and `<prefix>.lst` for `images`, in the given order.
///
/// Each image's position becomes its record id. Unreadable images are skipped
/// with a warning, leaving a gap in the ids.
pub fn pack_images(
    images: &[(PathBuf, usize)],
    root: &Path,
    prefix: &Path,
    options: &PackOptions,
) -> Result<PackSummary> {
    if let Some(parent) = prefix.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
    }

    let rec_path = with_suffix(prefix, ".rec");
    let lst_path = with_suffix(prefix, ".lst");

    let mut writer = RecordWriter::create(&rec_path)
        .with_context(|| format!("Failed to create record file: {:?}", rec_path))?;
    let mut list = ImageList::default();
    let mut skipped = 0;

    for (index, (path, label)) in images.iter().enumerate() {
        let bytes = match load_and_encode(path, options) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping {:?}: {:#}", path, e);
                skipped += 1;
                continue;
            }
        };

        let index = index as u64;
        let record = ImageRecord::new(index, vec![*label as f32], bytes);
        writer.write_record(&record.encode())?;

        let relative = path.strip_prefix(root).unwrap_or(path);
        list.push(ImageListEntry {
            index,
            labels: vec![*label as f32],
            path: relative.to_string_lossy().into_owned(),
        })?;

        if (index + 1) % 1000 == 0 {
            info!("Packed {}/{} images", index + 1, images.len());
        }
    }

    let packed = writer.num_records();
    writer.finish()?;
    list.save(&lst_path)?;

    Ok(PackSummary {
        rec_path,
        lst_path,
        packed,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageRecordConfig;
    use crate::data::loader::{DataLoader, ImageRecordLoader};
    use crate::data::recordio::RecordReader;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_png(path: &Path, width: u32, height: u32, value: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(width, height, Rgb([value; 3])).save(path).unwrap();
    }

    /// `cat/` holds two 8x4 images plus a stray text file, `dog/` one 8x4 image.
    fn image_tree(root: &Path) {
        write_png(&root.join("dog/x.png"), 8, 4, 200);
        write_png(&root.join("cat/b.png"), 8, 4, 100);
        write_png(&root.join("cat/a.png"), 8, 4, 50);
        fs::write(root.join("cat/notes.txt"), "not an image").unwrap();
    }

    #[test]
    fn classes_follow_sorted_directory_names() {
        let dir = TempDir::new().unwrap();
        image_tree(dir.path());

        let images = collect_images(dir.path()).unwrap();
        let found: Vec<(String, usize)> = images
            .iter()
            .map(|(p, label)| {
                let rel = p.strip_prefix(dir.path()).unwrap();
                (rel.to_string_lossy().replace('\\', "/"), *label)
            })
            .collect();
        assert_eq!(
            found,
            vec![
                ("cat/a.png".to_string(), 0),
                ("cat/b.png".to_string(), 0),
                ("dog/x.png".to_string(), 1),
            ]
        );
    }

    #[test]
    fn resize_scales_the_shorter_edge() {
        let wide = DynamicImage::ImageRgb8(RgbImage::new(8, 4));
        let resized = resize_shorter_edge(wide, 2);
        assert_eq!((resized.width(), resized.height()), (4, 2));

        let tall = DynamicImage::ImageRgb8(RgbImage::new(3, 9));
        let resized = resize_shorter_edge(tall, 6);
        assert_eq!((resized.width(), resized.height()), (6, 18));

        let kept = resize_shorter_edge(DynamicImage::ImageRgb8(RgbImage::new(5, 7)), 0);
        assert_eq!((kept.width(), kept.height()), (5, 7));
    }

    #[test]
    fn suffix_keeps_dotted_prefix() {
        assert_eq!(
            with_suffix(Path::new("out/sf1.v2"), ".rec"),
            PathBuf::from("out/sf1.v2.rec")
        );
    }

    #[test]
    fn packed_tree_loads_with_class_labels() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("images");
        image_tree(&root);

        let images = collect_images(&root).unwrap();
        let options = PackOptions {
            resize: 2,
            encoding: Encoding::Png,
        };
        let summary = pack_images(&images, &root, &dir.path().join("out/train"), &options).unwrap();
        assert_eq!(summary.packed, 3);
        assert_eq!(summary.skipped, 0);
        assert!(summary.lst_path.ends_with("train.lst"));

        let list = ImageList::load(&summary.lst_path, 1).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.labels(2), Some(&[1.0][..]));

        for record in RecordReader::open(&summary.rec_path).unwrap() {
            let record = ImageRecord::parse(&record.unwrap()).unwrap();
            let img = image::load_from_memory(&record.image).unwrap();
            assert_eq!((img.width(), img.height()), (4, 2));
        }

        let config = ImageRecordConfig::new(&summary.rec_path)
            .with_imglist(&summary.lst_path)
            .with_data_shape([3, 2, 4]);
        let mut loader =
            ImageRecordLoader::<NdArray<f32>>::new(config, 3, 0, Default::default()).unwrap();
        loader.reset();
        let batch = loader.next_batch().unwrap().unwrap();
        assert_eq!(batch.images.dims(), [3, 3, 2, 4]);
        let labels = batch.labels.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(labels, vec![0, 0, 1]);
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn unreadable_images_are_skipped() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("images");
        image_tree(&root);
        fs::write(root.join("dog/broken.png"), b"not a png").unwrap();

        let images = collect_images(&root).unwrap();
        assert_eq!(images.len(), 4);
        let summary =
            pack_images(&images, &root, &dir.path().join("out"), &PackOptions::default()).unwrap();
        assert_eq!(summary.packed, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(ImageList::load(&summary.lst_path, 1).unwrap().len(), 3);
    }
}
