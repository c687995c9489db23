//! Handling of unrecoverable durability loss.
//!
//! When a flush cannot reach a quorum of journals the log may already have
//! promised durability for transactions that are now in doubt. The log
//! poisons itself and invokes a [`FatalHandler`] exactly once.

use parking_lot::Mutex;

/// Receives the single fatal failure of a log.
pub trait FatalHandler: Send + Sync {
    fn on_fatal(&self, reason: &str);
}

/// Logs the failure and terminates the process with exit code 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitProcess;

impl FatalHandler for ExitProcess {
    fn on_fatal(&self, reason: &str) {
        tracing::error!("Fatal edit log failure, terminating: {}", reason);
        std::process::exit(1);
    }
}

/// Records fatal failures instead of exiting. Used by tests and embedders
/// that translate the failure themselves.
#[derive(Debug, Default)]
pub struct RecordingFatalHandler {
    reasons: Mutex<Vec<String>>,
}

impl RecordingFatalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fatal failures seen.
    pub fn count(&self) -> usize {
        self.reasons.lock().len()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }
}

impl FatalHandler for RecordingFatalHandler {
    fn on_fatal(&self, reason: &str) {
        tracing::error!("Fatal edit log failure: {}", reason);
        self.reasons.lock().push(reason.to_string());
    }
}
