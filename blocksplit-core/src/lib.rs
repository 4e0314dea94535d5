//! blocksplit core - splitting time-series blocks by label
//!
//! Takes immutable time-series blocks from object storage and re-partitions
//! every series into output blocks keyed by a subset of its labels:
//! - Relabeling decides which series survive and which labels select the
//!   output block (named in the `__meta_ext_labels` label)
//! - One block writer per distinct label combination, committed periodically
//!   to keep memory bounded
//! - Output metadata inherits the input block's labels, overridden by the
//!   extracted ones
//!
//! # Architecture
//!
//! - **block**: on-disk block format, writer (append/commit/flush) and reader
//! - **partition**: splits a label set into kept and extracted labels
//! - **routing**: maps extracted label sets to per-tenant writers
//! - **pipeline**: one pass over an input block; **reconcile** finalizes outputs
//! - **bucket**, **splitter**, **scheduler**: object storage orchestration
//! - **inspect**, **dump**, **import**, **analyze**: block tooling

pub mod analyze;
pub mod block;
pub mod bucket;
pub mod dump;
pub mod import;
pub mod inspect;
pub mod partition;
pub mod pipeline;
pub mod reconcile;
pub mod relabel;
pub mod routing;
pub mod scheduler;
pub mod splitter;
pub mod timeutil;

mod error;
mod types;

pub use error::{Result, SplitError};
pub use types::*;

pub use block::{BlockId, BlockMeta, BlockReader, BlockWriter};
pub use bucket::{BlockRef, Bucket, BucketConfig};
pub use pipeline::{SplitOutcome, SplitPipeline, SplitStats};
pub use relabel::{RelabelRules, Relabeler};
pub use routing::{RoutingTable, Tenant};
pub use scheduler::{ScheduleOptions, Scheduler};
pub use splitter::{BlockSplitter, SplitOptions, SplitReport};

/// blocksplit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Pending samples per tenant before an intermediate commit
    pub const COMMIT_THRESHOLD: usize = 5000;

    /// Maximum samples per chunk
    pub const MAX_SAMPLES_PER_CHUNK: usize = 120;

    /// Expected maximum block span (2h)
    pub const DEFAULT_BLOCK_DURATION_MS: i64 = 2 * 60 * 60 * 1000;

    /// Local scratch directory
    pub const DEFAULT_DATA_DIR: &str = "./data";

    /// Source tag written into output block metadata
    pub const SOURCE_TAG: &str = "blocksplit";

    /// Label naming the labels to split on, `;` separated
    pub const EXT_LABELS: &str = "__meta_ext_labels";

    /// Read configuration given either as a file path or inline content.
    ///
    /// Inline content wins when both are set; `None` when neither is.
    pub fn path_or_content(
        path: Option<&std::path::Path>,
        content: Option<&str>,
    ) -> crate::Result<Option<String>> {
        if let Some(content) = content {
            return Ok(Some(content.to_string()));
        }
        match path {
            Some(path) => std::fs::read_to_string(path).map(Some).map_err(|e| {
                crate::SplitError::Config(format!("read configuration file {:?}: {}", path, e))
            }),
            None => Ok(None),
        }
    }
}
