//! Journal error types.

use quorumlog_quorum::{CallError, QuorumError};
use thiserror::Error;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record corrupted at offset {offset}: CRC mismatch (expected {expected:#x}, got {actual:#x})")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("invalid record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("segment not found: {0}")]
    SegmentNotFound(u64),

    #[error("journal {0} is not formatted")]
    Unformatted(String),

    #[error("journal {target} out of sync: {reason}")]
    OutOfSync { target: String, reason: String },

    #[error("invalid journal state: {0}")]
    InvalidState(String),

    #[error("defect detected: {0}")]
    Defect(String),

    #[error("journal {target} unavailable: {reason}")]
    Unavailable { target: String, reason: String },

    #[error("journal is closed")]
    Closed,

    #[error("gap in transactions: cannot read txid {missing} (requested up to {requested})")]
    Gap { missing: u64, requested: u64 },

    #[error("quorum error: {0}")]
    Quorum(#[from] QuorumError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JournalError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            JournalError::Io(_) | JournalError::Unavailable { .. } => true,
            JournalError::Quorum(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns whether a quorum could not be assembled.
    pub fn is_quorum_loss(&self) -> bool {
        matches!(self, JournalError::Quorum(e) if !e.is_defect())
    }
}

impl CallError for JournalError {
    fn is_defect(&self) -> bool {
        matches!(self, JournalError::Defect(_))
    }
}
