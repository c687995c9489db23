//! In-memory journal target with fault injection.
//!
//! Used by tests and benchmarks to model slow, failing or misbehaving
//! replicas without touching the filesystem.

use crate::error::JournalError;
use crate::record::{Transaction, TxBatch};
use crate::segment::{LogSegment, SegmentStatus};
use crate::target::{check_continuity, JournalTarget, WriteAck};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Injected behavior of a [`MemoryJournal`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Every operation fails with the given reason.
    Fail(String),
    /// Operations block until the fault is healed, then run normally.
    Hang,
    /// Writes report a programming defect.
    Defect(String),
    /// Only finalizing segments fails.
    FailFinalize(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Format,
    Start,
    Write,
    Finalize,
    Abort,
    Recover,
    Read,
    Purge,
}

#[derive(Debug)]
struct MemSegment {
    txns: Vec<Transaction>,
    status: SegmentStatus,
    end_txid: u64,
}

#[derive(Debug, Default)]
struct Inner {
    formatted: bool,
    segments: BTreeMap<u64, MemSegment>,
    open: Option<u64>,
    last_written: u64,
}

/// A journal target that keeps every segment in memory.
pub struct MemoryJournal {
    id: String,
    inner: Mutex<Inner>,
    fault: Mutex<Fault>,
    healed: Condvar,
    writes: AtomicU64,
}

impl MemoryJournal {
    /// Creates a formatted, empty journal.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(Inner {
                formatted: true,
                ..Default::default()
            }),
            fault: Mutex::new(Fault::None),
            healed: Condvar::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Creates a journal that must be formatted before use.
    pub fn unformatted(id: impl Into<String>) -> Self {
        let journal = Self::new(id);
        journal.inner.lock().formatted = false;
        journal
    }

    /// Injects a fault. Takes effect for the next operation.
    pub fn inject(&self, fault: Fault) {
        *self.fault.lock() = fault;
    }

    /// Clears any injected fault and releases hung operations.
    pub fn heal(&self) {
        *self.fault.lock() = Fault::None;
        self.healed.notify_all();
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Last txid durably written to the current segment.
    pub fn last_written_txid(&self) -> u64 {
        self.inner.lock().last_written
    }

    /// All non-aborted transactions in txid order.
    pub fn transactions(&self) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner
            .segments
            .values()
            .filter(|s| s.status != SegmentStatus::Aborted)
            .flat_map(|s| s.txns.iter().cloned())
            .collect()
    }

    /// Every segment, including aborted ones.
    pub fn all_segments(&self) -> Vec<LogSegment> {
        let inner = self.inner.lock();
        inner
            .segments
            .iter()
            .map(|(start, s)| LogSegment {
                start_txid: *start,
                end_txid: s.end_txid,
                status: s.status,
            })
            .collect()
    }

    fn check_fault(&self, op: Op) -> Result<(), JournalError> {
        let mut fault = self.fault.lock();
        while *fault == Fault::Hang {
            self.healed.wait(&mut fault);
        }
        match &*fault {
            Fault::None | Fault::Hang => Ok(()),
            Fault::Fail(reason) => Err(JournalError::Unavailable {
                target: self.id.clone(),
                reason: reason.clone(),
            }),
            Fault::Defect(reason) if op == Op::Write => Err(JournalError::Defect(reason.clone())),
            Fault::FailFinalize(reason) if op == Op::Finalize => Err(JournalError::Unavailable {
                target: self.id.clone(),
                reason: reason.clone(),
            }),
            Fault::Defect(_) | Fault::FailFinalize(_) => Ok(()),
        }
    }

    fn check_formatted(&self, inner: &Inner) -> Result<(), JournalError> {
        if inner.formatted {
            Ok(())
        } else {
            Err(JournalError::Unformatted(self.id.clone()))
        }
    }
}

impl JournalTarget for MemoryJournal {
    fn id(&self) -> &str {
        &self.id
    }

    fn format(&self) -> Result<(), JournalError> {
        self.check_fault(Op::Format)?;
        let mut inner = self.inner.lock();
        if !inner.segments.is_empty() {
            return Err(JournalError::InvalidState(format!(
                "{} already holds segments",
                self.id
            )));
        }
        inner.formatted = true;
        Ok(())
    }

    fn start_segment(&self, start_txid: u64) -> Result<(), JournalError> {
        self.check_fault(Op::Start)?;
        let mut inner = self.inner.lock();
        self.check_formatted(&inner)?;

        // A lagging open segment is closed at whatever it reached.
        if let Some(open) = inner.open.take() {
            let last = inner.last_written;
            if let Some(segment) = inner.segments.get_mut(&open) {
                if segment.txns.is_empty() {
                    segment.status = SegmentStatus::Aborted;
                } else {
                    segment.status = SegmentStatus::Finalized;
                    segment.end_txid = last;
                }
            }
            tracing::warn!(
                "{}: closed lagging segment {} before starting {}",
                self.id,
                open,
                start_txid
            );
        }

        if let Some((start, s)) = inner
            .segments
            .iter()
            .find(|(_, s)| s.status == SegmentStatus::Finalized && s.end_txid >= start_txid)
        {
            return Err(JournalError::InvalidState(format!(
                "{}: segment {} overlaps finalized segment [{}, {}]",
                self.id, start_txid, start, s.end_txid
            )));
        }

        inner.segments.insert(
            start_txid,
            MemSegment {
                txns: Vec::new(),
                status: SegmentStatus::InProgress,
                end_txid: start_txid.saturating_sub(1),
            },
        );
        inner.open = Some(start_txid);
        inner.last_written = start_txid.saturating_sub(1);
        Ok(())
    }

    fn write(&self, segment_start: u64, batch: &TxBatch) -> Result<WriteAck, JournalError> {
        self.check_fault(Op::Write)?;
        let txns = batch.decode()?;
        let mut inner = self.inner.lock();
        check_continuity(&self.id, inner.open, inner.last_written, segment_start, batch)?;

        let last = batch.last_txid();
        if let Some(segment) = inner.segments.get_mut(&segment_start) {
            segment.txns.extend(txns);
            segment.end_txid = last;
        }
        inner.last_written = last;
        self.writes.fetch_add(1, Ordering::SeqCst);

        Ok(WriteAck {
            first_txid: batch.first_txid,
            last_txid: last,
            bytes: batch.data.len() as u64,
        })
    }

    fn finalize_segment(&self, start_txid: u64, end_txid: u64) -> Result<(), JournalError> {
        self.check_fault(Op::Finalize)?;
        let mut inner = self.inner.lock();
        let segment = inner
            .segments
            .get_mut(&start_txid)
            .ok_or(JournalError::SegmentNotFound(start_txid))?;

        if segment.status == SegmentStatus::Finalized && segment.end_txid == end_txid {
            return Ok(());
        }
        if segment.end_txid != end_txid {
            return Err(JournalError::OutOfSync {
                target: self.id.clone(),
                reason: format!(
                    "cannot finalize segment {} at {}: last txid is {}",
                    start_txid, end_txid, segment.end_txid
                ),
            });
        }
        segment.status = SegmentStatus::Finalized;
        if inner.open == Some(start_txid) {
            inner.open = None;
        }
        Ok(())
    }

    fn abort_segment(&self, start_txid: u64) -> Result<(), JournalError> {
        self.check_fault(Op::Abort)?;
        let mut inner = self.inner.lock();
        let segment = inner
            .segments
            .get_mut(&start_txid)
            .ok_or(JournalError::SegmentNotFound(start_txid))?;
        if segment.status == SegmentStatus::Finalized {
            return Err(JournalError::InvalidState(format!(
                "cannot abort finalized segment {}",
                start_txid
            )));
        }
        segment.status = SegmentStatus::Aborted;
        if inner.open == Some(start_txid) {
            inner.open = None;
        }
        Ok(())
    }

    fn recover_unfinalized(&self) -> Result<Vec<LogSegment>, JournalError> {
        self.check_fault(Op::Recover)?;
        let mut inner = self.inner.lock();
        self.check_formatted(&inner)?;
        inner.open = None;

        let mut recovered = Vec::new();
        for (start, segment) in inner.segments.iter_mut() {
            if segment.status != SegmentStatus::InProgress {
                continue;
            }
            segment.status = if segment.txns.is_empty() {
                SegmentStatus::Aborted
            } else {
                SegmentStatus::Finalized
            };
            recovered.push(LogSegment {
                start_txid: *start,
                end_txid: segment.end_txid,
                status: segment.status,
            });
        }
        Ok(recovered)
    }

    fn segments(
        &self,
        from_txid: u64,
        in_progress_ok: bool,
    ) -> Result<Vec<LogSegment>, JournalError> {
        self.check_fault(Op::Read)?;
        let inner = self.inner.lock();
        self.check_formatted(&inner)?;
        Ok(inner
            .segments
            .iter()
            .map(|(start, s)| LogSegment {
                start_txid: *start,
                end_txid: s.end_txid,
                status: s.status,
            })
            .filter(|s| match s.status {
                SegmentStatus::Finalized => true,
                SegmentStatus::InProgress => in_progress_ok && !s.is_empty(),
                SegmentStatus::Aborted => false,
            })
            .filter(|s| s.end_txid >= from_txid)
            .collect())
    }

    fn read_segment(&self, start_txid: u64) -> Result<Vec<Transaction>, JournalError> {
        self.check_fault(Op::Read)?;
        let inner = self.inner.lock();
        inner
            .segments
            .get(&start_txid)
            .map(|s| s.txns.clone())
            .ok_or(JournalError::SegmentNotFound(start_txid))
    }

    fn purge_before(&self, min_txid: u64) -> Result<usize, JournalError> {
        self.check_fault(Op::Purge)?;
        let mut inner = self.inner.lock();
        let before = inner.segments.len();
        inner.segments.retain(|_, s| {
            !(s.status == SegmentStatus::Aborted
                || (s.status == SegmentStatus::Finalized && s.end_txid < min_txid))
        });
        Ok(before - inner.segments.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TxKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn batch(first: u64, count: u64) -> TxBatch {
        let txns: Vec<Transaction> = (first..first + count)
            .map(|txid| Transaction::new(txid, TxKind::Op, format!("op-{}", txid)))
            .collect();
        TxBatch::from_transactions(&txns).unwrap()
    }

    #[test]
    fn test_write_and_finalize() {
        let journal = MemoryJournal::new("mem");
        journal.start_segment(1).unwrap();
        journal.write(1, &batch(1, 3)).unwrap();
        journal.write(1, &batch(4, 2)).unwrap();
        journal.finalize_segment(1, 5).unwrap();

        assert_eq!(journal.write_count(), 2);
        assert_eq!(journal.segments(0, false).unwrap(), vec![LogSegment::finalized(1, 5)]);
        assert_eq!(journal.read_segment(1).unwrap().len(), 5);

        // Finalizing twice is harmless.
        journal.finalize_segment(1, 5).unwrap();
    }

    #[test]
    fn test_write_out_of_order_rejected() {
        let journal = MemoryJournal::new("mem");
        journal.start_segment(1).unwrap();
        journal.write(1, &batch(1, 2)).unwrap();
        assert!(matches!(
            journal.write(1, &batch(5, 1)),
            Err(JournalError::OutOfSync { .. })
        ));
        assert!(matches!(
            journal.write(9, &batch(3, 1)),
            Err(JournalError::Defect(_))
        ));
    }

    #[test]
    fn test_fail_fault() {
        let journal = MemoryJournal::new("mem");
        journal.start_segment(1).unwrap();
        journal.inject(Fault::Fail("disk gone".into()));
        assert!(matches!(
            journal.write(1, &batch(1, 1)),
            Err(JournalError::Unavailable { .. })
        ));
        journal.heal();
        journal.write(1, &batch(1, 1)).unwrap();
    }

    #[test]
    fn test_fail_finalize_fault() {
        let journal = MemoryJournal::new("mem");
        journal.inject(Fault::FailFinalize("rename failed".into()));
        journal.start_segment(1).unwrap();
        journal.write(1, &batch(1, 2)).unwrap();
        assert!(journal.finalize_segment(1, 2).is_err());

        let recovered = journal.recover_unfinalized().unwrap();
        assert_eq!(recovered, vec![LogSegment::finalized(1, 2)]);
    }

    #[test]
    fn test_hang_released_by_heal() {
        let journal = Arc::new(MemoryJournal::new("mem"));
        journal.start_segment(1).unwrap();
        journal.inject(Fault::Hang);

        let writer = {
            let journal = Arc::clone(&journal);
            std::thread::spawn(move || journal.write(1, &batch(1, 1)))
        };

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(journal.write_count(), 0);
        journal.heal();
        writer.join().unwrap().unwrap();
        assert_eq!(journal.write_count(), 1);
    }

    #[test]
    fn test_recover_aborts_empty_segment() {
        let journal = MemoryJournal::new("mem");
        journal.start_segment(1).unwrap();
        let recovered = journal.recover_unfinalized().unwrap();
        assert_eq!(recovered, vec![LogSegment::aborted(1)]);
        assert!(journal.segments(0, true).unwrap().is_empty());
    }

    #[test]
    fn test_unformatted_rejects_start() {
        let journal = MemoryJournal::unformatted("mem");
        assert!(matches!(
            journal.start_segment(1),
            Err(JournalError::Unformatted(_))
        ));
        journal.format().unwrap();
        journal.start_segment(1).unwrap();
    }

    #[test]
    fn test_purge() {
        let journal = MemoryJournal::new("mem");
        journal.start_segment(1).unwrap();
        journal.write(1, &batch(1, 3)).unwrap();
        journal.finalize_segment(1, 3).unwrap();
        journal.start_segment(4).unwrap();
        journal.write(4, &batch(4, 3)).unwrap();
        journal.finalize_segment(4, 6).unwrap();

        assert_eq!(journal.purge_before(4).unwrap(), 1);
        assert_eq!(journal.segments(0, false).unwrap(), vec![LogSegment::finalized(4, 6)]);
    }
}
