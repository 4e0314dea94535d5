//! Block index: every series of a block with its chunk references

use super::chunk::ChunkRef;
use crate::{Labels, Result, SplitError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Index file magic
const MAGIC: &[u8; 4] = b"BSPI";

/// Index format version
const FORMAT_VERSION: u32 = 1;

/// Index entry for one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesEntry {
    pub labels: Labels,
    pub chunks: Vec<ChunkRef>,
}

/// All series of a block, sorted by labels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub series: Vec<SeriesEntry>,
}

impl Index {
    /// Write the index to `path`
    ///
    /// Format: magic, version, payload length, bincode payload, CRC32.
    pub fn write(&self, path: &Path) -> Result<()> {
        let payload = bincode::serialize(self)?;

        let mut buf = BytesMut::with_capacity(payload.len() + 16);
        buf.put_slice(MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        buf.put_u32_le(crc32fast::hash(&payload));

        let mut file = File::create(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read and validate the index at `path`
    pub fn read(path: &Path) -> Result<Self> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        if data.len() < 16 {
            return Err(SplitError::InvalidFormat("Index file too short".into()));
        }
        if &data[0..4] != MAGIC {
            return Err(SplitError::InvalidFormat("Invalid index magic".into()));
        }

        let mut cursor = std::io::Cursor::new(&data[4..]);
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(SplitError::InvalidFormat(format!(
                "Unsupported index version: {}",
                version
            )));
        }
        let len = cursor.get_u32_le() as usize;
        if data.len() != 12 + len + 4 {
            return Err(SplitError::Corruption(format!(
                "index payload length {} does not match file size {}",
                len,
                data.len()
            )));
        }

        let payload = &data[12..12 + len];
        let expected = (&data[12 + len..]).get_u32_le();
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(SplitError::ChecksumMismatch { expected, actual });
        }

        Ok(bincode::deserialize(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueKind;
    use tempfile::TempDir;

    #[test]
    fn test_index_write_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");
        let index = Index {
            series: vec![SeriesEntry {
                labels: Labels::from_pairs([("__name__", "up")]),
                chunks: vec![ChunkRef {
                    offset: 0,
                    len: 42,
                    kind: ValueKind::Float,
                    min_time: 1,
                    max_time: 9,
                    num_samples: 9,
                }],
            }],
        };
        index.write(&path).unwrap();
        assert_eq!(Index::read(&path).unwrap(), index);
    }

    #[test]
    fn test_index_checksum() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index");
        Index::default().write(&path).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        assert!(matches!(
            Index::read(&path),
            Err(SplitError::ChecksumMismatch { .. })
        ));
    }
}
