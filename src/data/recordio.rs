//! Reader and writer for the RecordIO container used by `.rec` image packs.
//!
//! Every physical record starts with the magic word and a length word whose
//! top three bits carry a continuation flag. Payloads are zero padded to a
//! four byte boundary. A logical record containing the magic word at an
//! aligned position is split into parts; the reader glues the parts back
//! together with the magic word in between.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

pub const MAGIC: u32 = 0xced7_230a;
const LENGTH_BITS: u32 = 29;
const LENGTH_MASK: u32 = (1 << LENGTH_BITS) - 1;
pub const MAX_RECORD_LEN: usize = LENGTH_MASK as usize;

#[derive(Debug, Error)]
pub enum RecordIoError {
    #[error("invalid magic word {found:#010x} at offset {offset}")]
    BadMagic { offset: u64, found: u32 },
    #[error("record at offset {offset} is truncated")]
    Truncated { offset: u64 },
    #[error("unexpected continuation flag {flag} at offset {offset}")]
    BadContinuation { offset: u64, flag: u32 },
    #[error("record of {0} bytes exceeds the RecordIO limit")]
    TooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Position of a physical part within its logical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Whole,
    First,
    Middle,
    Last,
}

impl Part {
    fn flag(self) -> u32 {
        match self {
            Part::Whole => 0,
            Part::First => 1,
            Part::Middle => 2,
            Part::Last => 3,
        }
    }

    fn from_flag(flag: u32, offset: u64) -> Result<Self, RecordIoError> {
        match flag {
            0 => Ok(Part::Whole),
            1 => Ok(Part::First),
            2 => Ok(Part::Middle),
            3 => Ok(Part::Last),
            _ => Err(RecordIoError::BadContinuation { offset, flag }),
        }
    }
}

fn encode_lrec(part: Part, len: usize) -> u32 {
    (part.flag() << LENGTH_BITS) | (len as u32 & LENGTH_MASK)
}

fn aligned(len: usize) -> usize {
    (len + 3) & !3
}

pub struct RecordReader<R> {
    inner: R,
    offset: u64,
}

impl RecordReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, RecordIoError> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read + Seek> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Byte offset of the next physical record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn seek(&mut self, offset: u64) -> Result<(), RecordIoError> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        Ok(())
    }

    /// Read the 8 byte header, or `None` at a clean end of stream.
    fn read_header(&mut self) -> Result<Option<(Part, usize)>, RecordIoError> {
        let mut header = [0u8; 8];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.inner.read(&mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < header.len() {
            return Err(RecordIoError::Truncated {
                offset: self.offset,
            });
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != MAGIC {
            return Err(RecordIoError::BadMagic {
                offset: self.offset,
                found: magic,
            });
        }
        let lrec = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let part = Part::from_flag(lrec >> LENGTH_BITS, self.offset)?;
        Ok(Some((part, (lrec & LENGTH_MASK) as usize)))
    }

    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, RecordIoError> {
        let start = self.offset;
        let mut record = Vec::new();
        let mut in_progress = false;

        loop {
            let header = match self.read_header()? {
                Some(header) => header,
                None if in_progress => return Err(RecordIoError::Truncated { offset: start }),
                None => return Ok(None),
            };
            let (part, len) = header;
            match (in_progress, part) {
                (false, Part::Whole | Part::First) | (true, Part::Middle | Part::Last) => {}
                _ => {
                    return Err(RecordIoError::BadContinuation {
                        offset: self.offset,
                        flag: part.flag(),
                    })
                }
            }

            let padded = aligned(len);
            let begin = record.len();
            record.resize(begin + padded, 0);
            self.inner
                .read_exact(&mut record[begin..])
                .map_err(|err| match err.kind() {
                    io::ErrorKind::UnexpectedEof => RecordIoError::Truncated { offset: start },
                    _ => RecordIoError::Io(err),
                })?;
            record.truncate(begin + len);
            self.offset += 8 + padded as u64;

            match part {
                Part::Whole | Part::Last => return Ok(Some(record)),
                Part::First | Part::Middle => {
                    record.extend_from_slice(&MAGIC.to_le_bytes());
                    in_progress = true;
                }
            }
        }
    }
}

impl<R: Read + Seek> Iterator for RecordReader<R> {
    type Item = Result<Vec<u8>, RecordIoError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

pub struct RecordWriter<W: Write> {
    inner: W,
    offset: u64,
    num_records: usize,
}

impl RecordWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, RecordIoError> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            offset: 0,
            num_records: 0,
        }
    }

    fn write_part(&mut self, part: Part, data: &[u8]) -> Result<(), RecordIoError> {
        self.inner.write_all(&MAGIC.to_le_bytes())?;
        self.inner
            .write_all(&encode_lrec(part, data.len()).to_le_bytes())?;
        self.inner.write_all(data)?;
        let padding = aligned(data.len()) - data.len();
        self.inner.write_all(&[0u8; 3][..padding])?;
        self.offset += 8 + aligned(data.len()) as u64;
        Ok(())
    }

    /// Append one logical record, returning the offset it starts at.
    pub fn write_record(&mut self, data: &[u8]) -> Result<u64, RecordIoError> {
        if data.len() > MAX_RECORD_LEN {
            return Err(RecordIoError::TooLarge(data.len()));
        }
        let start = self.offset;
        let magic = MAGIC.to_le_bytes();
        let mut begin = 0;

        for i in (0..data.len() & !3).step_by(4) {
            if data[i..i + 4] == magic {
                let part = if begin == 0 { Part::First } else { Part::Middle };
                self.write_part(part, &data[begin..i])?;
                begin = i + 4;
            }
        }

        let part = if begin == 0 { Part::Whole } else { Part::Last };
        self.write_part(part, &data[begin..])?;
        self.num_records += 1;
        Ok(start)
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    pub fn finish(mut self) -> Result<W, RecordIoError> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Start offsets of every logical record in a `.rec` file.
pub fn scan_offsets(path: &Path) -> Result<Vec<u64>, RecordIoError> {
    let mut reader = RecordReader::open(path)?;
    let mut offsets = Vec::new();
    loop {
        let offset = reader.offset();
        match reader.next_record()? {
            Some(_) => offsets.push(offset),
            None => return Ok(offsets),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_all(records: &[&[u8]]) -> (Vec<u8>, Vec<u64>) {
        let mut writer = RecordWriter::new(Vec::new());
        let offsets = records
            .iter()
            .map(|r| writer.write_record(r).unwrap())
            .collect();
        (writer.finish().unwrap(), offsets)
    }

    #[test]
    fn physical_layout_is_padded() {
        let (bytes, offsets) = write_all(&[b"abcde", b"xyz"]);
        assert_eq!(offsets, vec![0, 16]);
        assert_eq!(bytes.len(), 16 + 12);
        assert_eq!(&bytes[0..4], &MAGIC.to_le_bytes());
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 5);
        assert_eq!(&bytes[13..16], &[0, 0, 0]);
    }

    #[test]
    fn reads_back_records() {
        let (bytes, _) = write_all(&[b"first", b"", b"third record"]);
        let reader = RecordReader::new(Cursor::new(bytes));
        let records: Vec<Vec<u8>> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(
            records,
            vec![b"first".to_vec(), Vec::new(), b"third record".to_vec()]
        );
    }

    #[test]
    fn splits_on_embedded_magic() {
        let mut payload = b"head".to_vec();
        payload.extend_from_slice(&MAGIC.to_le_bytes());
        payload.extend_from_slice(b"mid!");
        payload.extend_from_slice(&MAGIC.to_le_bytes());
        payload.extend_from_slice(b"tail");

        let (bytes, _) = write_all(&[&payload, b"next"]);
        let flag = |at: usize| {
            u32::from_le_bytes([bytes[at + 4], bytes[at + 5], bytes[at + 6], bytes[at + 7]])
                >> LENGTH_BITS
        };
        assert_eq!(flag(0), 1);
        assert_eq!(flag(12), 2);
        assert_eq!(flag(24), 3);

        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert_eq!(reader.next_record().unwrap().unwrap(), payload);
        assert_eq!(reader.offset(), 36);
        assert_eq!(reader.next_record().unwrap().unwrap(), b"next".to_vec());
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn unaligned_magic_is_not_split() {
        let mut payload = b"ab".to_vec();
        payload.extend_from_slice(&MAGIC.to_le_bytes());
        let (bytes, _) = write_all(&[&payload]);
        assert_eq!(bytes.len(), 8 + 8);

        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert_eq!(reader.next_record().unwrap().unwrap(), payload);
    }

    #[test]
    fn seek_to_offset() {
        let (bytes, offsets) = write_all(&[b"one", b"two", b"three"]);
        let mut reader = RecordReader::new(Cursor::new(bytes));
        reader.seek(offsets[2]).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), b"three".to_vec());
        reader.seek(offsets[1]).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), b"two".to_vec());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut reader = RecordReader::new(Cursor::new(vec![0u8; 8]));
        assert!(matches!(
            reader.next_record(),
            Err(RecordIoError::BadMagic { offset: 0, found: 0 })
        ));
    }

    #[test]
    fn rejects_truncated_payload() {
        let (mut bytes, _) = write_all(&[b"truncate me"]);
        bytes.truncate(12);
        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.next_record(),
            Err(RecordIoError::Truncated { offset: 0 })
        ));
    }

    #[test]
    fn rejects_orphan_continuation() {
        let mut bytes = MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&encode_lrec(Part::Last, 0).to_le_bytes());
        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.next_record(),
            Err(RecordIoError::BadContinuation { flag: 3, .. })
        ));
    }

    #[test]
    fn scan_offsets_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = RecordWriter::create(file.path()).unwrap();
        let expected: Vec<u64> = [b"a".as_slice(), b"bbbbbbb", b"cc"]
            .iter()
            .map(|r| writer.write_record(r).unwrap())
            .collect();
        writer.finish().unwrap();

        assert_eq!(scan_offsets(file.path()).unwrap(), expected);
    }
}
