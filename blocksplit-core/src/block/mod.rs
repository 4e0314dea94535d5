//! On-disk time-series blocks
//!
//! A block is an immutable directory holding every series of a time range:
//!
//! - `meta.json`: time range, statistics and inherited labels
//! - `index`: series labels with references into the chunk file
//! - `chunks/000001`: checksummed, compressed chunk frames
//!
//! Blocks are produced by [`BlockWriter`] through an append/commit/flush
//! protocol and consumed by [`BlockReader`] through a forward-only series
//! cursor.

mod chunk;
mod index;
mod matcher;
mod meta;
mod reader;
mod writer;

pub use chunk::ChunkRef;
pub use matcher::{parse_selector, MatchType, Matcher};
pub use meta::{BlockMeta, BlockStats, CompactionMeta, Downsample, ThanosMeta, META_VERSION};
pub use reader::{BlockReader, Querier, SampleIterator, Series, SeriesSet};
pub use writer::{Appender, BlockWriter, BlockWriterOptions};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Metadata file name inside a block directory
pub const META_FILENAME: &str = "meta.json";

/// Index file name inside a block directory
pub const INDEX_FILENAME: &str = "index";

/// Chunk directory inside a block directory
pub const CHUNKS_DIR: &str = "chunks";

/// The single chunk segment written per block
pub const CHUNK_SEGMENT: &str = "000001";

/// Unique, time-ordered block identifier (ULID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Ulid);

impl BlockId {
    /// Generate a new identifier carrying the current time
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Creation time encoded in the identifier
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0.timestamp_ms() as i64).single()
    }

    /// Parse a directory name, returning `None` if it is not a block id
    pub fn from_dir_name(name: &str) -> Option<Self> {
        name.trim_end_matches('/').parse().ok()
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlockId {
    type Err = crate::SplitError;

    fn from_str(s: &str) -> crate::Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| crate::SplitError::InvalidFormat(format!("invalid block id {:?}: {}", s, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_round_trips_through_dir_name() {
        let id = BlockId::new();
        let parsed = BlockId::from_dir_name(&format!("{}/", id)).unwrap();
        assert_eq!(parsed, id);
        assert!(BlockId::from_dir_name("wal").is_none());
        assert!(BlockId::from_dir_name("0f8fad5b-d9cb-469f-a165-70867728950e").is_none());
    }

    #[test]
    fn test_block_id_parses_ulid_dir_names() {
        let id: BlockId = "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap();
        assert_eq!(id.to_string(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(id.created_at().unwrap().timestamp_millis(), 1_469_918_176_385);
    }

    #[test]
    fn test_block_id_carries_creation_time() {
        let before = Utc::now().timestamp();
        let created = BlockId::new().created_at().unwrap().timestamp();
        assert!(created >= before - 1 && created <= Utc::now().timestamp() + 1);
    }
}
