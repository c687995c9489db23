//! Log lifecycle states.

use crate::error::LogError;
use std::fmt;

/// State of an edit log instance.
///
/// ```text
/// Uninitialized ──init_for_write──▶ BetweenSegments ◀──end_log_segment── InSegment
///       │                              │        └────start_log_segment────▶ │
///       └──init_for_read──▶ OpenForReading                                   │
///                                 any non-closed state ──close──▶ Closed ◀───┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogState {
    Uninitialized,
    BetweenSegments,
    InSegment,
    OpenForReading,
    Closed,
}

impl LogState {
    /// Whether the log is initialized for writing.
    pub fn is_open_for_write(&self) -> bool {
        matches!(self, LogState::BetweenSegments | LogState::InSegment)
    }

    /// Whether segments may be read in this state.
    pub fn is_readable(&self) -> bool {
        matches!(
            self,
            LogState::BetweenSegments | LogState::InSegment | LogState::OpenForReading
        )
    }

    /// Fails with `InvalidState` unless the state is one of `allowed`.
    pub fn require(self, operation: &'static str, allowed: &[LogState]) -> Result<(), LogError> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(LogError::InvalidState {
                operation,
                state: self,
            })
        }
    }
}

impl fmt::Display for LogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogState::Uninitialized => "UNINITIALIZED",
            LogState::BetweenSegments => "BETWEEN_SEGMENTS",
            LogState::InSegment => "IN_SEGMENT",
            LogState::OpenForReading => "OPEN_FOR_READING",
            LogState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require() {
        assert!(LogState::InSegment
            .require("append", &[LogState::InSegment])
            .is_ok());

        let err = LogState::BetweenSegments
            .require("append", &[LogState::InSegment])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot append while log is BETWEEN_SEGMENTS"
        );
    }

    #[test]
    fn test_state_predicates() {
        assert!(LogState::InSegment.is_open_for_write());
        assert!(LogState::BetweenSegments.is_open_for_write());
        assert!(!LogState::OpenForReading.is_open_for_write());
        assert!(LogState::OpenForReading.is_readable());
        assert!(!LogState::Closed.is_readable());
        assert!(!LogState::Uninitialized.is_readable());
    }
}
