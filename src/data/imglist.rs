use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageListEntry {
    pub index: u64,
    pub labels: Vec<f32>,
    pub path: String,
}

/// Contents of a `.lst` file: `index \t label... \t path` per line.
#[derive(Debug, Clone, Default)]
pub struct ImageList {
    entries: Vec<ImageListEntry>,
    by_index: HashMap<u64, usize>,
}

impl ImageList {
    pub fn load(path: &Path, label_width: usize) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read image list: {:?}", path))?;
        let list = Self::parse(&text, label_width)
            .with_context(|| format!("Invalid image list: {:?}", path))?;
        info!("Loaded image list {:?} ({} entries)", path, list.len());
        Ok(list)
    }

    pub fn parse(text: &str, label_width: usize) -> Result<Self> {
        let mut list = Self::default();

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < label_width + 2 {
                anyhow::bail!(
                    "line {}: expected index, {} label(s) and a path, got {} field(s)",
                    line_no + 1,
                    label_width,
                    fields.len()
                );
            }

            let index = fields[0]
                .trim()
                .parse::<u64>()
                .with_context(|| format!("line {}: invalid index {:?}", line_no + 1, fields[0]))?;
            let labels = fields[1..=label_width]
                .iter()
                .map(|f| {
                    f.trim()
                        .parse::<f32>()
                        .with_context(|| format!("line {}: invalid label {:?}", line_no + 1, f))
                })
                .collect::<Result<Vec<_>>>()?;
            // paths may themselves contain tabs
            let path = fields[label_width + 1..].join("\t");

            list.push(ImageListEntry {
                index,
                labels,
                path,
            })?;
        }

        Ok(list)
    }

    pub fn push(&mut self, entry: ImageListEntry) -> Result<()> {
        if self.by_index.contains_key(&entry.index) {
            anyhow::bail!("duplicate image index {}", entry.index);
        }
        self.by_index.insert(entry.index, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    pub fn labels(&self, index: u64) -> Option<&[f32]> {
        self.by_index
            .get(&index)
            .map(|&i| self.entries[i].labels.as_slice())
    }

    pub fn entries(&self) -> &[ImageListEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let labels: String = entry.labels.iter().map(|label| format!("\t{:.6}", label)).collect();
            out.push_str(&format!("{}{}\t{}\n", entry.index, labels, entry.path));
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text())
            .with_context(|| format!("Failed to write image list: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries() {
        let text = "0\t1.000000\tcat/0.jpg\n\n1\t0\tdog/1.jpg\r\n";
        let list = ImageList::parse(text, 1).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.labels(0), Some([1.0].as_slice()));
        assert_eq!(list.labels(1), Some([0.0].as_slice()));
        assert_eq!(list.labels(2), None);
        assert_eq!(list.entries()[1].path, "dog/1.jpg");
    }

    #[test]
    fn multi_label_width() {
        let list = ImageList::parse("5\t1\t2\t3\tx.png", 3).unwrap();
        assert_eq!(list.labels(5), Some([1.0, 2.0, 3.0].as_slice()));
        assert_eq!(list.entries()[0].path, "x.png");
    }

    #[test]
    fn reports_line_numbers() {
        let err = ImageList::parse("0\t1\ta.jpg\nbroken\n", 1).unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));

        let err = ImageList::parse("x\t1\ta.jpg\n", 1).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid index"));
    }

    #[test]
    fn rejects_duplicate_index() {
        assert!(ImageList::parse("0\t1\ta.jpg\n0\t2\tb.jpg\n", 1).is_err());
    }

    #[test]
    fn text_round_trip_through_file() {
        let mut list = ImageList::default();
        list.push(ImageListEntry {
            index: 3,
            labels: vec![2.0],
            path: "b/3.jpg".into(),
        })
        .unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        list.save(file.path()).unwrap();
        let loaded = ImageList::load(file.path(), 1).unwrap();
        assert_eq!(loaded.entries(), list.entries());
        assert_eq!(list.to_text(), "3\t2.000000\tb/3.jpg\n");
    }

    #[test]
    fn multi_label_lines_keep_every_label() {
        let mut list = ImageList::default();
        for (index, labels) in [(0, vec![1.0, 0.5]), (7, vec![0.0, 2.25])] {
            list.push(ImageListEntry {
                index,
                labels,
                path: format!("img_{index}.png"),
            })
            .unwrap();
        }
        assert_eq!(
            list.to_text(),
            "0\t1.000000\t0.500000\timg_0.png\n7\t0.000000\t2.250000\timg_7.png\n"
        );
        let parsed = ImageList::parse(&list.to_text(), 2).unwrap();
        assert_eq!(parsed.labels(7), Some(&[0.0, 2.25][..]));
    }
}
