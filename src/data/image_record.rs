use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat};
use std::io::Cursor;
use thiserror::Error;

/// Size in bytes of the packed header preceding every image payload.
pub const HEADER_SIZE: usize = 24;

#[derive(Debug, Error)]
pub enum ImageRecordError {
    #[error("record of {0} bytes is shorter than the image header")]
    ShortHeader(usize),
    #[error("header announces {expected} labels but only {available} bytes follow")]
    ShortLabels { expected: usize, available: usize },
    #[error("unsupported channel count {0}, expected 1 or 3")]
    Channels(usize),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageHeader {
    /// Number of extra labels after the header; 0 means `label` is used.
    pub flag: u32,
    pub label: f32,
    pub id: u64,
    pub id2: u64,
}

impl ImageHeader {
    pub fn new(id: u64, label: f32) -> Self {
        Self {
            flag: 0,
            label,
            id,
            id2: 0,
        }
    }

    fn read(bytes: &[u8]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u64_at = |i: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(word)
        };
        Self {
            flag: u32_at(0),
            label: f32::from_bits(u32_at(4)),
            id: u64_at(8),
            id2: u64_at(16),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flag.to_le_bytes());
        out.extend_from_slice(&self.label.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.id2.to_le_bytes());
    }
}

/// One entry of an image `.rec` file: header, labels and encoded image bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub header: ImageHeader,
    pub labels: Vec<f32>,
    pub image: Vec<u8>,
}

impl ImageRecord {
    pub fn new(id: u64, labels: Vec<f32>, image: Vec<u8>) -> Self {
        let mut header = ImageHeader::new(id, labels.first().copied().unwrap_or(0.0));
        if labels.len() > 1 {
            header.flag = labels.len() as u32;
        }
        Self {
            header,
            labels,
            image,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ImageRecordError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ImageRecordError::ShortHeader(bytes.len()));
        }
        let header = ImageHeader::read(bytes);
        let mut body = &bytes[HEADER_SIZE..];

        let labels = if header.flag > 0 {
            let count = header.flag as usize;
            if body.len() < count * 4 {
                return Err(ImageRecordError::ShortLabels {
                    expected: count,
                    available: body.len(),
                });
            }
            let (raw, rest) = body.split_at(count * 4);
            body = rest;
            raw.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        } else {
            vec![header.label]
        };

        Ok(Self {
            header,
            labels,
            image: body.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.labels.len() * 4 + self.image.len());
        self.header.write(&mut out);
        if self.header.flag > 0 {
            for label in &self.labels {
                out.extend_from_slice(&label.to_le_bytes());
            }
        }
        out.extend_from_slice(&self.image);
        out
    }

    pub fn label(&self) -> f32 {
        self.labels.first().copied().unwrap_or(self.header.label)
    }
}

/// Per-pixel normalisation applied while decoding.
#[derive(Debug, Clone, Copy)]
pub struct Normalize {
    pub mean_rgb: [f32; 3],
    pub scale: f32,
}

impl Default for Normalize {
    fn default() -> Self {
        Self {
            mean_rgb: [0.0; 3],
            scale: 1.0,
        }
    }
}

/// Decode an encoded image into `data_shape` (`[C, H, W]`) CHW floats,
/// resizing when the stored size differs.
pub fn decode_image(
    bytes: &[u8],
    data_shape: [usize; 3],
    normalize: Normalize,
) -> Result<Vec<f32>, ImageRecordError> {
    let [channels, height, width] = data_shape;
    if channels != 1 && channels != 3 {
        return Err(ImageRecordError::Channels(channels));
    }

    let mut img = image::load_from_memory(bytes)?;
    if img.width() as usize != width || img.height() as usize != height {
        img = img.resize_exact(width as u32, height as u32, FilterType::Triangle);
    }

    let plane = height * width;
    let mut out = vec![0.0f32; channels * plane];

    if channels == 1 {
        let luma = img.to_luma8();
        for (x, y, pixel) in luma.enumerate_pixels() {
            let idx = y as usize * width + x as usize;
            out[idx] = (f32::from(pixel.0[0]) - normalize.mean_rgb[0]) * normalize.scale;
        }
    } else {
        let rgb = img.to_rgb8();
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let idx = y as usize * width + x as usize;
            for c in 0..3 {
                out[c * plane + idx] = (f32::from(pixel.0[c]) - normalize.mean_rgb[c]) * normalize.scale;
            }
        }
    }

    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Jpeg(u8),
    Png,
}

/// Encode an image for storage inside a record.
pub fn encode_image(img: &DynamicImage, encoding: Encoding) -> Result<Vec<u8>, ImageRecordError> {
    let mut buf = Cursor::new(Vec::new());
    match encoding {
        Encoding::Jpeg(quality) => {
            DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut buf, ImageOutputFormat::Jpeg(quality))?
        }
        Encoding::Png => img.write_to(&mut buf, ImageOutputFormat::Png)?,
    }
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        encode_image(&DynamicImage::ImageRgb8(img), Encoding::Png).unwrap()
    }

    #[test]
    fn header_layout() {
        let record = ImageRecord::new(7, vec![3.0], b"img".to_vec());
        let bytes = record.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(&bytes[0..4], &0u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3.0f32.to_le_bytes());
        assert_eq!(&bytes[8..16], &7u64.to_le_bytes());
        assert_eq!(&bytes[HEADER_SIZE..], b"img");

        let parsed = ImageRecord::parse(&bytes).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.label(), 3.0);
    }

    #[test]
    fn multi_label_records() {
        let record = ImageRecord::new(1, vec![2.0, 5.0, 9.0], b"jpeg".to_vec());
        assert_eq!(record.header.flag, 3);
        let parsed = ImageRecord::parse(&record.encode()).unwrap();
        assert_eq!(parsed.labels, vec![2.0, 5.0, 9.0]);
        assert_eq!(parsed.image, b"jpeg".to_vec());
        assert_eq!(parsed.label(), 2.0);
    }

    #[test]
    fn short_inputs_are_rejected() {
        assert!(matches!(
            ImageRecord::parse(&[0u8; 10]),
            Err(ImageRecordError::ShortHeader(10))
        ));

        let mut bytes = Vec::new();
        let mut header = ImageHeader::new(0, 0.0);
        header.flag = 4;
        header.write(&mut bytes);
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            ImageRecord::parse(&bytes),
            Err(ImageRecordError::ShortLabels { expected: 4, available: 8 })
        ));
    }

    #[test]
    fn decodes_to_chw_with_normalisation() {
        let png = solid_png(4, 4, [10, 20, 30]);
        let normalize = Normalize {
            mean_rgb: [10.0, 10.0, 10.0],
            scale: 0.5,
        };
        let pixels = decode_image(&png, [3, 4, 4], normalize).unwrap();
        assert_eq!(pixels.len(), 48);
        assert!(pixels[..16].iter().all(|p| *p == 0.0));
        assert!(pixels[16..32].iter().all(|p| *p == 5.0));
        assert!(pixels[32..].iter().all(|p| *p == 10.0));
    }

    #[test]
    fn resizes_to_requested_shape() {
        let png = solid_png(10, 6, [255, 255, 255]);
        let pixels = decode_image(&png, [3, 8, 8], Normalize::default()).unwrap();
        assert_eq!(pixels.len(), 3 * 64);
        assert!(pixels.iter().all(|p| (*p - 255.0).abs() < 1.0));
    }

    #[test]
    fn grayscale_output() {
        let png = solid_png(2, 2, [100, 100, 100]);
        let pixels = decode_image(&png, [1, 2, 2], Normalize::default()).unwrap();
        assert_eq!(pixels, vec![100.0; 4]);
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(matches!(
            decode_image(b"not an image", [3, 2, 2], Normalize::default()),
            Err(ImageRecordError::Decode(_))
        ));
        assert!(matches!(
            decode_image(b"", [2, 2, 2], Normalize::default()),
            Err(ImageRecordError::Channels(2))
        ));
    }
}
