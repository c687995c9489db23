//! Node error types.

use crate::config::ConfigError;
use quorumlog_core::LogError;
use quorumlog_journal::JournalError;
use thiserror::Error;

/// Node errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("edit log error: {0}")]
    Log(#[from] LogError),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("image {txid} checksum mismatch: expected {expected}, got {actual}")]
    ImageCorrupted {
        txid: u64,
        expected: String,
        actual: String,
    },

    #[error("image for txid {0} already exists")]
    ImageExists(u64),

    #[error("apply failed at txid {txid}: {reason}")]
    Apply { txid: u64, reason: String },

    #[error("node shutting down")]
    ShuttingDown,
}

impl NodeError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Io(_) => true,
            NodeError::Log(e) => e.is_retryable(),
            NodeError::Journal(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns whether the edit log lost durability.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Log(e) if e.is_fatal())
    }
}
