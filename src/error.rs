//! Error types for the updates repository.

use crate::types::{BlockId, Height};
use thiserror::Error;

/// Main error type for repository operations.
#[derive(Debug, Error)]
pub enum UpdatesError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("out of order update: expected height {expected}, got {got}")]
    OutOfOrder { expected: Height, got: Height },

    #[error("no liquid key block to apply the update to")]
    NoLiquidKeyBlock,

    #[error("inconsistent rollback at height {height}: target id {target} does not match any known block")]
    InconsistentRollback { height: Height, target: BlockId },

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("stream start {from} is past the current tip {height}")]
    OutOfRange { from: Height, height: Height },

    #[error("subscriber fell behind and was disconnected")]
    SlowConsumer,

    #[error("timed out waiting for an update")]
    Timeout,
}

impl From<rmp_serde::encode::Error> for UpdatesError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        UpdatesError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for UpdatesError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        UpdatesError::CorruptRecord(e.to_string())
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, UpdatesError>;
