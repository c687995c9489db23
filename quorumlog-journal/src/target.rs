//! The journal target abstraction.

use crate::error::JournalError;
use crate::record::{Transaction, TxBatch};
use crate::segment::LogSegment;

/// Acknowledgment of a durable write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub first_txid: u64,
    pub last_txid: u64,
    pub bytes: u64,
}

/// One replica of the log.
///
/// Every method is synchronous and may block; the journal set calls them
/// from a dedicated thread per target. A write must only return `Ok` once
/// the batch is durable on the target.
pub trait JournalTarget: Send + Sync + 'static {
    /// Stable identifier, used as the quorum key.
    fn id(&self) -> &str;

    /// Initializes empty storage, discarding nothing.
    fn format(&self) -> Result<(), JournalError>;

    /// Opens a new in-progress segment beginning at `start_txid`.
    fn start_segment(&self, start_txid: u64) -> Result<(), JournalError>;

    /// Durably appends a batch to the open segment `segment_start`.
    fn write(&self, segment_start: u64, batch: &TxBatch) -> Result<WriteAck, JournalError>;

    /// Marks the segment `[start, end]` finalized.
    fn finalize_segment(&self, start_txid: u64, end_txid: u64) -> Result<(), JournalError>;

    /// Discards the in-progress segment `start_txid`.
    fn abort_segment(&self, start_txid: u64) -> Result<(), JournalError>;

    /// Finalizes or aborts every in-progress segment left by a crash and
    /// returns the resulting segments.
    fn recover_unfinalized(&self) -> Result<Vec<LogSegment>, JournalError>;

    /// Lists readable segments that end at or after `from_txid`.
    fn segments(&self, from_txid: u64, in_progress_ok: bool)
        -> Result<Vec<LogSegment>, JournalError>;

    /// Reads every valid transaction of the segment starting at `start_txid`.
    fn read_segment(&self, start_txid: u64) -> Result<Vec<Transaction>, JournalError>;

    /// Removes finalized segments that end before `min_txid`.
    fn purge_before(&self, min_txid: u64) -> Result<usize, JournalError>;

    fn close(&self) -> Result<(), JournalError> {
        Ok(())
    }
}

/// Checks that a batch continues an open segment.
///
/// `last_written` is the last txid already on the target for that segment.
pub(crate) fn check_continuity(
    target: &str,
    open_segment: Option<u64>,
    last_written: u64,
    segment_start: u64,
    batch: &TxBatch,
) -> Result<(), JournalError> {
    match open_segment {
        None => {
            return Err(JournalError::Defect(format!(
                "write of txid {} to {} with no open segment",
                batch.first_txid, target
            )))
        }
        Some(open) if open != segment_start => {
            return Err(JournalError::Defect(format!(
                "write for segment {} but {} has segment {} open",
                segment_start, target, open
            )))
        }
        Some(_) => {}
    }

    if batch.first_txid != last_written + 1 {
        return Err(JournalError::OutOfSync {
            target: target.to_string(),
            reason: format!(
                "batch starts at txid {} but last written is {}",
                batch.first_txid, last_written
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_check_continuity() {
        let batch = TxBatch::new(5, 2, Bytes::new());
        assert!(check_continuity("a", Some(1), 4, 1, &batch).is_ok());
        assert!(matches!(
            check_continuity("a", None, 4, 1, &batch),
            Err(JournalError::Defect(_))
        ));
        assert!(matches!(
            check_continuity("a", Some(3), 4, 1, &batch),
            Err(JournalError::Defect(_))
        ));
        assert!(matches!(
            check_continuity("a", Some(1), 2, 1, &batch),
            Err(JournalError::OutOfSync { .. })
        ));
    }
}
