pub mod image_record;
pub mod imglist;
pub mod loader;
pub mod pack;
pub mod recordio;

pub use image_record::{decode_image, encode_image, Encoding, ImageHeader, ImageRecord, Normalize};
pub use imglist::{ImageList, ImageListEntry};
pub use loader::{DataLoader, ImageRecordLoader, RandomDataLoader};
pub use pack::{collect_images, pack_images, PackOptions, PackSummary};
pub use recordio::{scan_offsets, RecordReader, RecordWriter};
