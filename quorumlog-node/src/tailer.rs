//! Log tailing for reader nodes.

use crate::error::NodeError;
use quorumlog_core::EditLog;
use quorumlog_journal::{Transaction, TxKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Periodically reads new transactions from the journals and hands them to
/// an applier.
pub struct LogTailer {
    log: Arc<EditLog>,
    period: Duration,
    in_progress_ok: bool,
    last_applied: AtomicU64,
    shutdown: AtomicBool,
    notify: Notify,
}

impl LogTailer {
    /// Creates a tailer that resumes after `last_applied`.
    pub fn new(log: Arc<EditLog>, last_applied: u64, period: Duration) -> Self {
        Self {
            log,
            period,
            in_progress_ok: false,
            last_applied: AtomicU64::new(last_applied),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Also read segments that are still being written.
    pub fn with_in_progress(mut self, in_progress_ok: bool) -> Self {
        self.in_progress_ok = in_progress_ok;
        self
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Reads everything after the last applied txid once. Boundary markers
    /// advance the position without reaching the applier. Returns the number
    /// of transactions consumed.
    pub fn poll_once<F>(&self, applier: &mut F) -> Result<usize, NodeError>
    where
        F: FnMut(&Transaction) -> Result<(), NodeError>,
    {
        let from = self.last_applied() + 1;
        let outcome = self.log.read_from(from, 0, self.in_progress_ok)?;

        let mut consumed = 0;
        for txn in &outcome.transactions {
            let expected = self.last_applied() + 1;
            if txn.txid < expected {
                continue;
            }
            if txn.txid != expected {
                return Err(NodeError::Apply {
                    txid: txn.txid,
                    reason: format!("expected txid {}", expected),
                });
            }
            if txn.kind == TxKind::Op {
                applier(txn)?;
            }
            self.last_applied.store(txn.txid, Ordering::Release);
            consumed += 1;
        }
        Ok(consumed)
    }

    /// Runs the tailing loop (call from a background task).
    ///
    /// Journal reads block, so every poll runs on the blocking pool.
    pub async fn run<F>(self: Arc<Self>, mut applier: F)
    where
        F: FnMut(&Transaction) -> Result<(), NodeError> + Send + 'static,
    {
        tracing::info!(
            "Log tailer started after txid {} (period {} ms)",
            self.last_applied(),
            self.period.as_millis()
        );

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.period) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let tailer = Arc::clone(&self);
            let polled = tokio::task::spawn_blocking(move || {
                let result = tailer.poll_once(&mut applier);
                (applier, result)
            })
            .await;
            let result = match polled {
                Ok((returned, result)) => {
                    applier = returned;
                    result
                }
                Err(e) => {
                    tracing::error!("Log tailing task failed: {}", e);
                    break;
                }
            };

            match result {
                Ok(0) => {}
                Ok(n) => tracing::debug!(
                    "Tailed {} transactions through txid {}",
                    n,
                    self.last_applied()
                ),
                Err(e) => tracing::warn!(
                    "Log tailing failed after txid {}: {}",
                    self.last_applied(),
                    e
                ),
            }
        }

        tracing::info!("Log tailer stopped at txid {}", self.last_applied());
    }

    /// Wakes the loop for an immediate poll.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Signals the loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use quorumlog_core::{EditLogConfig, RecordingFatalHandler};
    use quorumlog_journal::{Fault, JournalSet, JournalSetConfig, JournalTarget, MemoryJournal};
    use std::time::Instant;

    fn set_over(journals: &[Arc<MemoryJournal>]) -> Arc<JournalSet> {
        let targets: Vec<Arc<dyn JournalTarget>> = journals
            .iter()
            .map(|j| Arc::clone(j) as Arc<dyn JournalTarget>)
            .collect();
        Arc::new(JournalSet::new(targets, JournalSetConfig::new(2)).unwrap())
    }

    fn log_over(journals: &[Arc<MemoryJournal>]) -> Arc<EditLog> {
        Arc::new(
            EditLog::new(set_over(journals), EditLogConfig::default())
                .with_fatal_handler(Arc::new(RecordingFatalHandler::new())),
        )
    }

    fn journals() -> Vec<Arc<MemoryJournal>> {
        (0..3)
            .map(|i| Arc::new(MemoryJournal::new(format!("m{}", i))))
            .collect()
    }

    #[test]
    fn test_poll_applies_finalized_segments() {
        let journals = journals();
        let writer = log_over(&journals);
        writer.init_for_write().unwrap();
        writer.open_for_write().unwrap();
        for i in 0..5 {
            writer.log_edit(format!("op-{}", i)).unwrap();
        }
        writer.sync_all().unwrap();

        let reader = log_over(&journals);
        reader.init_for_read().unwrap();
        let tailer = LogTailer::new(Arc::clone(&reader), 0, Duration::from_secs(60));

        let mut applied = Vec::new();
        let mut applier = |txn: &Transaction| {
            applied.push(txn.payload.clone());
            Ok(())
        };

        // Nothing is finalized yet.
        assert_eq!(tailer.poll_once(&mut applier).unwrap(), 0);

        assert_eq!(writer.roll_log().unwrap(), 8);
        assert_eq!(tailer.poll_once(&mut applier).unwrap(), 7);
        assert_eq!(tailer.last_applied(), 7);

        writer.log_edit("op-5").unwrap();
        writer.end_log_segment().unwrap();
        assert_eq!(tailer.poll_once(&mut applier).unwrap(), 3);
        assert_eq!(tailer.last_applied(), 10);

        assert_eq!(applied.len(), 6);
        assert_eq!(applied[0], Bytes::from("op-0"));
        assert_eq!(applied[5], Bytes::from("op-5"));
    }

    #[test]
    fn test_in_progress_tailing() {
        let journals = journals();
        let writer = log_over(&journals);
        writer.init_for_write().unwrap();
        writer.open_for_write().unwrap();
        writer.log_edit("live").unwrap();
        writer.sync_all().unwrap();

        let reader = log_over(&journals);
        reader.init_for_read().unwrap();
        let tailer =
            LogTailer::new(reader, 0, Duration::from_secs(60)).with_in_progress(true);
        let mut count = 0;
        tailer
            .poll_once(&mut |_: &Transaction| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(tailer.last_applied(), 2);
    }

    #[test]
    fn test_applier_failure_stops_at_txid() {
        let journals = journals();
        let writer = log_over(&journals);
        writer.init_for_write().unwrap();
        writer.open_for_write().unwrap();
        for i in 0..3 {
            writer.log_edit(format!("op-{}", i)).unwrap();
        }
        writer.end_log_segment().unwrap();

        let reader = log_over(&journals);
        reader.init_for_read().unwrap();
        let tailer = LogTailer::new(reader, 0, Duration::from_secs(60));
        let result = tailer.poll_once(&mut |txn: &Transaction| {
            if txn.txid == 3 {
                Err(NodeError::Apply {
                    txid: txn.txid,
                    reason: "rejected".into(),
                })
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(NodeError::Apply { txid: 3, .. })));
        assert_eq!(tailer.last_applied(), 2);
    }

    #[test]
    fn test_run_loop() {
        tokio_test::block_on(async {
            let journals = journals();
            let writer = log_over(&journals);
            writer.init_for_write().unwrap();
            writer.open_for_write().unwrap();
            writer.log_edit("first").unwrap();
            writer.end_log_segment().unwrap();

            let reader = log_over(&journals);
            reader.init_for_read().unwrap();
            let tailer = Arc::new(LogTailer::new(reader, 0, Duration::from_millis(10)));
            let seen = Arc::new(Mutex::new(Vec::new()));

            let handle = {
                let seen = Arc::clone(&seen);
                tokio::spawn(Arc::clone(&tailer).run(move |txn| {
                    seen.lock().push(txn.txid);
                    Ok(())
                }))
            };

            tailer.trigger();
            for _ in 0..200 {
                if tailer.last_applied() == 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tailer.shutdown();
            handle.await.unwrap();

            assert_eq!(tailer.last_applied(), 3);
            assert_eq!(*seen.lock(), vec![2]);
        });
    }

    #[test]
    fn test_run_loop_keeps_runtime_responsive() {
        tokio_test::block_on(async {
            let journals = journals();
            let writer = log_over(&journals);
            writer.init_for_write().unwrap();
            writer.open_for_write().unwrap();
            writer.log_edit("first").unwrap();
            writer.end_log_segment().unwrap();

            let targets: Vec<Arc<dyn JournalTarget>> = journals
                .iter()
                .map(|j| Arc::clone(j) as Arc<dyn JournalTarget>)
                .collect();
            let config = JournalSetConfig::new(2)
                .with_write_timeout(Duration::from_millis(300))
                .with_segment_timeout(Duration::from_millis(300));
            let set = Arc::new(JournalSet::new(targets, config).unwrap());
            let reader = Arc::new(
                EditLog::new(set, EditLogConfig::default())
                    .with_fatal_handler(Arc::new(RecordingFatalHandler::new())),
            );
            reader.init_for_read().unwrap();
            for journal in &journals {
                journal.inject(Fault::Hang);
            }

            let tailer = Arc::new(LogTailer::new(reader, 0, Duration::from_millis(10)));
            let handle = tokio::spawn(Arc::clone(&tailer).run(|_| Ok(())));
            tailer.trigger();

            // Polls are now stuck on the journals; timers must still fire.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let started = Instant::now();
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(started.elapsed() < Duration::from_millis(250));

            tailer.shutdown();
            for journal in &journals {
                journal.heal();
            }
            handle.await.unwrap();
        });
    }
}
