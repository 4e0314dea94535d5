//! Error types for blocksplit

use crate::types::Labels;
use thiserror::Error;

/// Result type alias for blocksplit operations
pub type Result<T> = std::result::Result<T, SplitError>;

/// blocksplit error types
#[derive(Error, Debug)]
pub enum SplitError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sample timestamp is not newer than the last one appended for its series
    #[error("Out of order sample for series {labels}: timestamp {timestamp} <= last {last}")]
    OutOfOrderSample {
        labels: Labels,
        timestamp: i64,
        last: i64,
    },

    /// Storage refused a sample
    #[error("Append rejected: {0}")]
    Append(String),

    /// The block writer has nothing to flush
    #[error("No samples appended, refusing to write an empty block")]
    EmptyBlock,

    /// Warnings reported by the series cursor, escalated to a hard failure
    #[error("Series cursor reported {} warning(s): {}", .0.len(), .0.join("; "))]
    Warnings(Vec<String>),

    /// Two different extracted label sets produced the same routing key
    #[error("Routing key {key:#018x} collision between {existing} and {incoming}")]
    RoutingCollision {
        key: u64,
        existing: Labels,
        incoming: Labels,
    },

    /// Object storage operation failed
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Object or block not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A block failed; carries the offending block id
    #[error("Block {block}: {source}")]
    Block {
        block: String,
        #[source]
        source: Box<SplitError>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SplitError {
    /// Attach the id of the block being processed
    pub fn for_block(self, block: impl Into<String>) -> Self {
        match self {
            SplitError::Block { .. } => self,
            other => SplitError::Block {
                block: block.into(),
                source: Box::new(other),
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SplitError::Io(_) | SplitError::ObjectStore(_) => true,
            SplitError::Block { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        match self {
            SplitError::Corruption(_) | SplitError::ChecksumMismatch { .. } => true,
            SplitError::Block { source, .. } => source.is_corruption(),
            _ => false,
        }
    }

    /// Check if error is a configuration problem (fatal before any block runs)
    pub fn is_config(&self) -> bool {
        matches!(self, SplitError::Config(_))
    }

    /// Check if the error means an object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            SplitError::NotFound(_) => true,
            SplitError::ObjectStore(object_store::Error::NotFound { .. }) => true,
            SplitError::Block { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<bincode::Error> for SplitError {
    fn from(e: bincode::Error) -> Self {
        SplitError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for SplitError {
    fn from(e: serde_json::Error) -> Self {
        SplitError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_context_wraps_once() {
        let err = SplitError::Corruption("bad chunk".into())
            .for_block("a")
            .for_block("b");
        assert!(err.is_corruption());
        assert_eq!(err.to_string(), "Block a: Data corruption: bad chunk");
    }

    #[test]
    fn test_retryable_through_block_context() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        assert!(SplitError::Io(io).for_block("a").is_retryable());
        assert!(!SplitError::Corruption("x".into()).for_block("a").is_retryable());
        assert!(!SplitError::Config("x".into()).is_retryable());
    }

    #[test]
    fn test_warnings_message() {
        let err = SplitError::Warnings(vec!["one".into(), "two".into()]);
        assert_eq!(
            err.to_string(),
            "Series cursor reported 2 warning(s): one; two"
        );
    }
}
