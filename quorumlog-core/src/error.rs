//! Edit log error types.

use crate::state::LogState;
use quorumlog_journal::JournalError;
use thiserror::Error;

/// Errors from the edit log.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("cannot {operation} while log is {state}")]
    InvalidState {
        operation: &'static str,
        state: LogState,
    },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The txid was buffered in a segment that was aborted before it synced.
    #[error("txid {0} was discarded with an aborted segment")]
    Discarded(u64),

    /// Durability was lost. The log refuses every later mutation.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
}

impl LogError {
    /// Returns whether this error is the distinguished durability loss.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LogError::Fatal(_))
    }

    /// Returns whether the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogError::Journal(e) if e.is_retryable())
    }
}
