//! Typed error type for the queue crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("offset {offset} is past the end of log '{log}' ({end})")]
    OffsetOutOfRange { log: String, offset: u64, end: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
