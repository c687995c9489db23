//! Quorum error types.

use thiserror::Error;

/// Errors raised while waiting on a quorum call.
#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("timed out after {waited_ms} ms waiting for {operation} (succeeded: [{succeeded}], failed: [{failed}])")]
    Timeout {
        operation: String,
        waited_ms: u64,
        succeeded: String,
        failed: String,
    },

    #[error("defect reported by {key} during {operation}: {message}")]
    Defect {
        operation: String,
        key: String,
        message: String,
    },

    #[error("{}", summarize(.message, .successes, .failures))]
    Failed {
        message: String,
        successes: Vec<(String, String)>,
        failures: Vec<(String, String)>,
    },
}

impl QuorumError {
    /// Returns whether this error is a timeout rather than a reported failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, QuorumError::Timeout { .. })
    }

    /// Returns whether this error carries a detected programming defect.
    pub fn is_defect(&self) -> bool {
        matches!(self, QuorumError::Defect { .. })
    }

    /// Returns whether the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
    }
}

fn summarize(
    message: &str,
    successes: &[(String, String)],
    failures: &[(String, String)],
) -> String {
    let mut out = format!("{}. {} successful responses", message, successes.len());
    for (key, result) in successes {
        out.push_str(&format!("\n{}: {}", key, result));
    }
    out.push_str(&format!("\n{} exceptions thrown", failures.len()));
    for (key, error) in failures {
        out.push_str(&format!("\n{}: {}", key, error));
    }
    out
}
