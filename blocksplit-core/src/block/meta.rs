//! Block metadata (`meta.json`)

use super::{BlockId, META_FILENAME};
use crate::{Result, SplitError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Supported `meta.json` version
pub const META_VERSION: u32 = 1;

/// Block metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    /// Block identifier
    pub ulid: BlockId,
    /// First timestamp in the block (inclusive)
    pub min_time: Timestamp,
    /// End of the block range (exclusive)
    pub max_time: Timestamp,
    pub stats: BlockStats,
    pub compaction: CompactionMeta,
    pub version: u32,
    /// Labels and provenance attached to the whole block
    #[serde(default)]
    pub thanos: ThanosMeta,
}

/// Sample, series and chunk counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub num_samples: u64,
    pub num_series: u64,
    pub num_chunks: u64,
    #[serde(default)]
    pub num_float_samples: u64,
    #[serde(default)]
    pub num_histogram_samples: u64,
}

/// Compaction provenance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionMeta {
    pub level: u32,
    #[serde(default)]
    pub sources: Vec<BlockId>,
}

/// Block-level (inherited) labels and provenance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThanosMeta {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub downsample: Downsample,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub version: u32,
}

/// Downsampling resolution in milliseconds; 0 means raw data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Downsample {
    pub resolution: i64,
}

impl BlockMeta {
    /// Read `meta.json` from a block directory
    pub fn read_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(META_FILENAME);
        let data = fs::read(&path)?;
        Self::from_slice(&data)
    }

    /// Parse and validate `meta.json` content
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let meta: BlockMeta = serde_json::from_slice(data)?;
        if meta.version != META_VERSION {
            return Err(SplitError::InvalidFormat(format!(
                "unexpected meta.json version {} for block {}",
                meta.version, meta.ulid
            )));
        }
        Ok(meta)
    }

    /// Write `meta.json` into a block directory, replacing it atomically
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let path = dir.join(META_FILENAME);
        let tmp = dir.join(format!("{}.tmp", META_FILENAME));

        let data = serde_json::to_vec_pretty(self)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Duration covered by the block in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.max_time - self.min_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_meta() -> BlockMeta {
        let id = BlockId::new();
        BlockMeta {
            ulid: id,
            min_time: 1000,
            max_time: 2001,
            stats: BlockStats {
                num_samples: 10,
                num_series: 2,
                num_chunks: 2,
                num_float_samples: 10,
                num_histogram_samples: 0,
            },
            compaction: CompactionMeta {
                level: 1,
                sources: vec![id],
            },
            version: META_VERSION,
            thanos: ThanosMeta {
                labels: BTreeMap::from([("region".to_string(), "eu".to_string())]),
                downsample: Downsample { resolution: 0 },
                source: "sidecar".into(),
                version: 1,
            },
        }
    }

    #[test]
    fn test_meta_write_read() {
        let temp_dir = TempDir::new().unwrap();
        let meta = sample_meta();
        meta.write_to_dir(temp_dir.path()).unwrap();

        let read = BlockMeta::read_from_dir(temp_dir.path()).unwrap();
        assert_eq!(read, meta);
        assert!(!temp_dir.path().join("meta.json.tmp").exists());
    }

    #[test]
    fn test_meta_json_layout() {
        let json = serde_json::to_value(sample_meta()).unwrap();
        assert_eq!(json["minTime"], 1000);
        assert_eq!(json["stats"]["numSamples"], 10);
        assert_eq!(json["thanos"]["labels"]["region"], "eu");
        assert_eq!(json["thanos"]["downsample"]["resolution"], 0);
    }

    #[test]
    fn test_meta_rejects_unknown_version() {
        let mut meta = sample_meta();
        meta.version = 7;
        let data = serde_json::to_vec(&meta).unwrap();
        assert!(matches!(
            BlockMeta::from_slice(&data),
            Err(SplitError::InvalidFormat(_))
        ));
    }
}
