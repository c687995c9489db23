//! Per-target asynchronous channel.
//!
//! Each target gets one worker thread that executes its operations in
//! submission order. Results are delivered to a quorum settler, so a slow or
//! hung target never blocks the caller beyond the quorum wait.

use crate::error::JournalError;
use crate::record::TxBatch;
use crate::target::{JournalTarget, WriteAck};
use parking_lot::Mutex;
use quorumlog_quorum::Settler;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

type Job = Box<dyn FnOnce(&dyn JournalTarget) + Send>;

/// Ordered, asynchronous access to one journal target.
pub struct TargetChannel {
    id: String,
    target: Arc<dyn JournalTarget>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    /// Set after a failed write; cleared by a successful segment start.
    out_of_sync: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    /// Bytes of write batches queued but not yet executed.
    queued_bytes: Arc<AtomicU64>,
    max_queued_bytes: u64,
}

impl TargetChannel {
    /// Starts the worker thread for `target`.
    ///
    /// Once more than `max_queued_bytes` of writes wait for the target, it
    /// is treated as too far behind: further writes fail immediately and the
    /// channel stays out of sync until the next segment start.
    pub fn spawn(
        target: Arc<dyn JournalTarget>,
        max_queued_bytes: u64,
    ) -> Result<Self, JournalError> {
        let id = target.id().to_string();
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker_target = Arc::clone(&target);

        std::thread::Builder::new()
            .name(format!("journal-{}", id))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job(worker_target.as_ref());
                }
                tracing::debug!("Journal channel {} stopped", worker_target.id());
            })?;

        Ok(Self {
            id,
            target,
            sender: Mutex::new(Some(sender)),
            out_of_sync: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(AtomicUsize::new(0)),
            queued_bytes: Arc::new(AtomicU64::new(0)),
            max_queued_bytes,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &Arc<dyn JournalTarget> {
        &self.target
    }

    /// Whether writes are being rejected until the next segment start.
    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync.load(Ordering::SeqCst)
    }

    /// Number of submitted operations not yet executed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Bytes of writes submitted but not yet executed.
    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes.load(Ordering::SeqCst)
    }

    /// Queues `op` and settles its result into `settler`.
    pub fn submit<R, F>(&self, settler: Settler<String, R, JournalError>, op: F)
    where
        R: Send + 'static,
        F: FnOnce(&dyn JournalTarget) -> Result<R, JournalError> + Send + 'static,
    {
        let pending = Arc::clone(&self.pending);
        let job_settler = settler.clone();
        let job: Job = Box::new(move |target| {
            pending.fetch_sub(1, Ordering::SeqCst);
            job_settler.settle(op(target));
        });
        self.enqueue(job, settler);
    }

    /// Queues a segment start. Success brings the channel back in sync.
    pub fn start_segment(&self, settler: Settler<String, (), JournalError>, start_txid: u64) {
        let out_of_sync = Arc::clone(&self.out_of_sync);
        self.submit(settler, move |target| {
            target.start_segment(start_txid)?;
            if out_of_sync.swap(false, Ordering::SeqCst) {
                tracing::info!("Journal {} back in sync at segment {}", target.id(), start_txid);
            }
            Ok(())
        });
    }

    /// Queues a write.
    ///
    /// A failed write leaves the target with a hole, so every later write is
    /// refused until a new segment is started. Writes to a target that is
    /// already out of sync, or too far behind, fail without being queued.
    pub fn write(
        &self,
        settler: Settler<String, WriteAck, JournalError>,
        segment_start: u64,
        batch: TxBatch,
    ) {
        let size = batch.data.len() as u64;
        if let Err(e) = self.admit_write(&batch, size) {
            settler.failure(e);
            return;
        }

        let out_of_sync = Arc::clone(&self.out_of_sync);
        let queued_bytes = Arc::clone(&self.queued_bytes);
        self.submit(settler, move |target| {
            queued_bytes.fetch_sub(size, Ordering::SeqCst);
            if out_of_sync.load(Ordering::SeqCst) {
                return Err(JournalError::OutOfSync {
                    target: target.id().to_string(),
                    reason: format!(
                        "skipping txids {}-{} after an earlier failed write",
                        batch.first_txid,
                        batch.last_txid()
                    ),
                });
            }
            let result = target.write(segment_start, &batch);
            if let Err(e) = &result {
                if !out_of_sync.swap(true, Ordering::SeqCst) {
                    tracing::warn!(
                        "Journal {} failed write of txids {}-{}, marking out of sync: {}",
                        target.id(),
                        batch.first_txid,
                        batch.last_txid(),
                        e
                    );
                }
            }
            result
        });
    }

    /// Reserves queue space for a write of `size` bytes.
    fn admit_write(&self, batch: &TxBatch, size: u64) -> Result<(), JournalError> {
        if self.is_out_of_sync() {
            return Err(JournalError::OutOfSync {
                target: self.id.clone(),
                reason: format!(
                    "skipping txids {}-{} after an earlier failed write",
                    batch.first_txid,
                    batch.last_txid()
                ),
            });
        }

        // A single batch is always admitted to an idle queue.
        let queued = self.queued_bytes.fetch_add(size, Ordering::SeqCst);
        if queued == 0 || queued + size <= self.max_queued_bytes {
            return Ok(());
        }
        self.queued_bytes.fetch_sub(size, Ordering::SeqCst);

        if !self.out_of_sync.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "Journal {} is too far behind ({} bytes queued, limit {}), marking out of sync",
                self.id,
                queued,
                self.max_queued_bytes
            );
        }
        Err(JournalError::OutOfSync {
            target: self.id.clone(),
            reason: format!(
                "{} bytes already queued, limit is {}",
                queued, self.max_queued_bytes
            ),
        })
    }

    /// Stops accepting operations. Queued operations still run; the worker
    /// exits after the last one.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    fn enqueue<R>(&self, job: Job, settler: Settler<String, R, JournalError>) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            settler.failure(JournalError::Closed);
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            settler.failure(JournalError::Closed);
        }
    }
}

impl Drop for TargetChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, MemoryJournal};
    use crate::record::{Transaction, TxKind};
    use crate::set::DEFAULT_MAX_QUEUED_BYTES;
    use quorumlog_quorum::{QuorumCall, QuorumPolicy};
    use std::time::Duration;

    fn batch(first: u64, count: u64) -> TxBatch {
        let txns: Vec<Transaction> = (first..first + count)
            .map(|txid| Transaction::new(txid, TxKind::Op, format!("op-{}", txid)))
            .collect();
        TxBatch::from_transactions(&txns).unwrap()
    }

    fn single<R>(id: &str) -> (QuorumCall<String, R, JournalError>, Settler<String, R, JournalError>)
    where
        R: Clone + std::fmt::Debug + Send + 'static,
    {
        let call = QuorumCall::new([id.to_string()], QuorumPolicy::default());
        let settler = call.settler(&id.to_string()).unwrap();
        (call, settler)
    }

    #[test]
    fn test_operations_run_in_order() {
        let journal = Arc::new(MemoryJournal::new("m"));
        let channel = TargetChannel::spawn(journal.clone(), DEFAULT_MAX_QUEUED_BYTES).unwrap();

        let (start, settler) = single::<()>("m");
        channel.start_segment(settler, 1);
        let mut writes = Vec::new();
        for i in 0..5 {
            let (call, settler) = single::<WriteAck>("m");
            channel.write(settler, 1, batch(1 + i * 2, 2));
            writes.push(call);
        }

        start.wait_for(1, 0, 0, Duration::from_secs(5), "start").unwrap();
        for call in &writes {
            call.wait_for(1, 0, 0, Duration::from_secs(5), "write").unwrap();
            assert_eq!(call.count_successes(), 1);
        }
        assert_eq!(journal.last_written_txid(), 10);
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn test_failed_write_marks_out_of_sync() {
        let journal = Arc::new(MemoryJournal::new("m"));
        let channel = TargetChannel::spawn(journal.clone(), DEFAULT_MAX_QUEUED_BYTES).unwrap();

        let (call, settler) = single::<()>("m");
        channel.start_segment(settler, 1);
        call.wait_for(1, 0, 0, Duration::from_secs(5), "start").unwrap();

        journal.inject(Fault::Fail("disk full".into()));
        let (call, settler) = single::<WriteAck>("m");
        channel.write(settler, 1, batch(1, 1));
        call.wait_for(1, 0, 0, Duration::from_secs(5), "write").unwrap();
        assert_eq!(call.count_exceptions(), 1);
        assert!(channel.is_out_of_sync());

        // Healing the target is not enough; the hole must be skipped.
        journal.heal();
        let (call, settler) = single::<WriteAck>("m");
        channel.write(settler, 1, batch(2, 1));
        call.wait_for(1, 0, 0, Duration::from_secs(5), "write").unwrap();
        assert_eq!(call.count_exceptions(), 1);

        let (call, settler) = single::<()>("m");
        channel.start_segment(settler, 3);
        call.wait_for(1, 0, 0, Duration::from_secs(5), "start").unwrap();
        assert_eq!(call.count_successes(), 1);
        assert!(!channel.is_out_of_sync());
    }

    #[test]
    fn test_closed_channel_settles_closed() {
        let journal = Arc::new(MemoryJournal::new("m"));
        let channel = TargetChannel::spawn(journal, DEFAULT_MAX_QUEUED_BYTES).unwrap();
        channel.close();

        let (call, settler) = single::<()>("m");
        channel.start_segment(settler, 1);
        assert_eq!(call.count_exceptions(), 1);
    }
}
