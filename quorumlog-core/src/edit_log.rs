//! The edit log.
//!
//! Transaction ids are assigned under a single lock and the encoded
//! transactions collect in a write buffer. A sync runs in three phases:
//!
//! 1. Swap (lock held): note the last assigned txid and take the buffer
//! 2. Flush (lock released): write the batch to a quorum of journals
//! 3. Commit (lock held): advance the synced txid and wake waiters
//!
//! Only one flush runs at a time. Callers whose txid is covered by a running
//! flush wait for it instead of issuing their own, so concurrent writers
//! share one journal round trip (group commit).

use crate::buffer::EditBuffer;
use crate::error::LogError;
use crate::fatal::{ExitProcess, FatalHandler};
use crate::state::LogState;
use crate::stats::{LogStats, LogStatsSnapshot};
use crate::DEFAULT_SYNC_BUFFER_SIZE;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use quorumlog_journal::{
    JournalSet, LogSegment, ReadOutcome, Transaction, TxBatch, TxKind, INVALID_TXID,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest a waiter sleeps before re-checking its condition.
const WAIT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default age of buffered transactions after which a sync is requested.
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(5);

/// Default interval between statistics reports.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Edit log configuration.
#[derive(Debug, Clone)]
pub struct EditLogConfig {
    /// Buffered bytes at which an append asks for a sync.
    pub sync_buffer_size: usize,
    /// Time since the last sync at which an append asks for a sync.
    /// Zero disables the check.
    pub sync_period: Duration,
    /// Minimum interval between statistics reports.
    pub stats_interval: Duration,
}

impl Default for EditLogConfig {
    fn default() -> Self {
        Self {
            sync_buffer_size: DEFAULT_SYNC_BUFFER_SIZE,
            sync_period: DEFAULT_SYNC_PERIOD,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

impl EditLogConfig {
    pub fn with_sync_buffer_size(mut self, size: usize) -> Self {
        self.sync_buffer_size = size;
        self
    }

    pub fn with_sync_period(mut self, period: Duration) -> Self {
        self.sync_period = period;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }
}

/// Result of appending a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// The assigned txid. Pass it to [`EditLog::sync`] to wait for durability.
    pub txid: u64,
    /// Whether the buffer policy asks the caller to sync now.
    pub needs_sync: bool,
}

struct Inner {
    state: LogState,
    /// Last assigned txid.
    txid: u64,
    /// Last durable txid.
    synctxid: u64,
    cur_segment_txid: u64,
    sync_in_progress: bool,
    auto_sync_scheduled: bool,
    /// A segment start or end marker is being written; appends wait.
    boundary_in_progress: bool,
    /// Txids dropped unsynced by the last segment abort. Never durable.
    discarded: Option<(u64, u64)>,
    buffer: EditBuffer,
    poisoned: Option<String>,
    last_sync: Instant,
    last_stats_print: Instant,
}

impl Inner {
    fn check_poisoned(&self) -> Result<(), LogError> {
        match &self.poisoned {
            Some(reason) => Err(LogError::Fatal(reason.clone())),
            None => Ok(()),
        }
    }

    fn check_discarded(&self, txid: u64) -> Result<(), LogError> {
        match self.discarded {
            Some((first, last)) if (first..=last).contains(&txid) => Err(LogError::Discarded(txid)),
            _ => Ok(()),
        }
    }
}

/// Quorum-committed, segmented write-ahead log.
pub struct EditLog {
    config: EditLogConfig,
    journals: Arc<JournalSet>,
    inner: Mutex<Inner>,
    changed: Condvar,
    fatal: Arc<dyn FatalHandler>,
    stats: LogStats,
}

impl EditLog {
    /// Creates an uninitialized log over `journals`.
    ///
    /// Durability loss terminates the process unless another handler is
    /// installed with [`EditLog::with_fatal_handler`].
    pub fn new(journals: Arc<JournalSet>, config: EditLogConfig) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(Inner {
                state: LogState::Uninitialized,
                txid: INVALID_TXID,
                synctxid: INVALID_TXID,
                cur_segment_txid: INVALID_TXID,
                sync_in_progress: false,
                auto_sync_scheduled: false,
                boundary_in_progress: false,
                discarded: None,
                buffer: EditBuffer::new(config.sync_buffer_size),
                poisoned: None,
                last_sync: now,
                last_stats_print: now,
            }),
            config,
            journals,
            changed: Condvar::new(),
            fatal: Arc::new(ExitProcess),
            stats: LogStats::default(),
        }
    }

    pub fn with_fatal_handler(mut self, handler: Arc<dyn FatalHandler>) -> Self {
        self.fatal = handler;
        self
    }

    pub fn config(&self) -> &EditLogConfig {
        &self.config
    }

    pub fn journals(&self) -> &Arc<JournalSet> {
        &self.journals
    }

    pub fn state(&self) -> LogState {
        self.inner.lock().state
    }

    pub fn is_open_for_write(&self) -> bool {
        self.inner.lock().state.is_open_for_write()
    }

    /// Last assigned txid.
    pub fn last_written_txid(&self) -> u64 {
        self.inner.lock().txid
    }

    /// Last durable txid.
    pub fn synced_txid(&self) -> u64 {
        self.inner.lock().synctxid
    }

    /// Start of the open segment, if any.
    pub fn current_segment_txid(&self) -> Option<u64> {
        let txid = self.inner.lock().cur_segment_txid;
        (txid != INVALID_TXID).then_some(txid)
    }

    pub fn is_sync_running(&self) -> bool {
        self.inner.lock().sync_in_progress
    }

    /// The fatal failure this log hit, if any.
    pub fn poisoned(&self) -> Option<String> {
        self.inner.lock().poisoned.clone()
    }

    pub fn stats(&self) -> LogStatsSnapshot {
        let inner = self.inner.lock();
        self.stats.snapshot(inner.txid, inner.synctxid)
    }

    /// Prepares the log for writing.
    pub fn init_for_write(&self) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        inner.check_poisoned()?;
        inner
            .state
            .require("initialize for write", &[LogState::Uninitialized, LogState::Closed])?;
        inner.state = LogState::BetweenSegments;
        tracing::info!(
            "Edit log initialized for write over {} journals",
            self.journals.len()
        );
        Ok(())
    }

    /// Prepares the log for reading only.
    pub fn init_for_read(&self) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        inner.check_poisoned()?;
        inner
            .state
            .require("initialize for read", &[LogState::Uninitialized, LogState::Closed])?;
        inner.state = LogState::OpenForReading;
        tracing::info!("Edit log initialized for read");
        Ok(())
    }

    /// Finalizes or aborts segments left open by a previous writer and
    /// adopts the highest recovered txid. Returns the last written txid.
    pub fn recover_unclosed_segments(&self) -> Result<u64, LogError> {
        let mut inner = self.inner.lock();
        self.wait_for_boundary(&mut inner)?;
        inner
            .state
            .require("recover unclosed segments", &[LogState::BetweenSegments])?;

        if let Some(last) = self.journals.recover_unfinalized()? {
            if last > inner.txid {
                inner.txid = last;
                inner.synctxid = last;
            }
        }
        tracing::info!(
            "Recovered unclosed segments, last written txid {}",
            inner.txid
        );
        Ok(inner.txid)
    }

    /// Resumes numbering at `next_txid`, for positions learned externally.
    pub fn set_next_txid(&self, next_txid: u64) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        self.wait_for_boundary(&mut inner)?;
        if inner.state == LogState::InSegment {
            return Err(LogError::InvalidState {
                operation: "set next txid",
                state: inner.state,
            });
        }
        if next_txid < inner.txid + 1 {
            return Err(LogError::IllegalArgument(format!(
                "next txid {} would not follow last written txid {}",
                next_txid, inner.txid
            )));
        }
        if next_txid <= inner.synctxid {
            return Err(LogError::IllegalArgument(format!(
                "next txid {} is not beyond synced txid {}",
                next_txid, inner.synctxid
            )));
        }
        inner.txid = next_txid - 1;
        Ok(())
    }

    /// Starts a segment at `last_written_txid + 1`, refusing if some journal
    /// can already serve that txid. Returns the segment start.
    pub fn open_for_write(&self) -> Result<u64, LogError> {
        let segment_txid = {
            let inner = self.inner.lock();
            inner.check_poisoned()?;
            inner
                .state
                .require("open for write", &[LogState::BetweenSegments])?;
            inner.txid + 1
        };

        let readable = self.journals.select_segments(segment_txid, true)?;
        if let Some(segment) = readable.first() {
            return Err(LogError::IllegalArgument(format!(
                "cannot start writing at txid {} when segment {} is available for read",
                segment_txid, segment
            )));
        }

        self.start_log_segment(segment_txid)?;
        Ok(segment_txid)
    }

    /// Starts a segment and durably writes its start marker.
    pub fn start_log_segment(&self, segment_txid: u64) -> Result<(), LogError> {
        {
            let mut inner = self.inner.lock();
            self.wait_for_boundary(&mut inner)?;
            inner
                .state
                .require("start log segment", &[LogState::BetweenSegments])?;
            if segment_txid != inner.txid + 1 {
                return Err(LogError::IllegalArgument(format!(
                    "cannot start segment at txid {} when last written txid is {}",
                    segment_txid, inner.txid
                )));
            }
            inner.boundary_in_progress = true;
        }

        // Readers of the log state stay responsive during the quorum wait.
        let started = self.journals.start_segment(segment_txid);

        let marker_txid = {
            let mut inner = self.inner.lock();
            if let Err(e) = started.map_err(LogError::from).and_then(|()| inner.check_poisoned()) {
                inner.boundary_in_progress = false;
                self.changed.notify_all();
                return Err(e);
            }

            inner.state = LogState::InSegment;
            inner.cur_segment_txid = segment_txid;
            inner.last_sync = Instant::now();
            match self.append_locked(&mut inner, TxKind::StartSegment, Bytes::new()) {
                Ok(txid) => txid,
                Err(e) => {
                    inner.boundary_in_progress = false;
                    self.changed.notify_all();
                    return Err(e);
                }
            }
        };

        tracing::info!("Starting log segment at {}", segment_txid);
        let result = self.sync(marker_txid);
        self.finish_boundary();
        result
    }

    /// Writes the end marker, syncs everything and finalizes the segment.
    /// Returns the last txid of the segment.
    pub fn end_log_segment(&self) -> Result<u64, LogError> {
        let (segment_txid, end_txid) = {
            let mut inner = self.inner.lock();
            self.wait_for_boundary(&mut inner)?;
            inner
                .state
                .require("end log segment", &[LogState::InSegment])?;

            inner.boundary_in_progress = true;
            match self.append_locked(&mut inner, TxKind::EndSegment, Bytes::new()) {
                Ok(txid) => (inner.cur_segment_txid, txid),
                Err(e) => {
                    inner.boundary_in_progress = false;
                    self.changed.notify_all();
                    return Err(e);
                }
            }
        };

        if let Err(e) = self.sync(end_txid) {
            self.finish_boundary();
            return Err(e);
        }

        {
            let inner = self.inner.lock();
            if inner.txid != end_txid || inner.synctxid != end_txid {
                let reason = format!(
                    "segment end marker {} is not the last durable transaction (last written {}, synced {})",
                    end_txid, inner.txid, inner.synctxid
                );
                return Err(self.fail(inner, reason));
            }
        }

        let finalized = self.journals.finalize_segment(segment_txid, end_txid);

        let mut inner = self.inner.lock();
        if let Err(e) = finalized {
            let reason = format!(
                "could not finalize segment [{}, {}] on a quorum of journals: {}",
                segment_txid, end_txid, e
            );
            return Err(self.fail(inner, reason));
        }

        inner.state = LogState::BetweenSegments;
        inner.cur_segment_txid = INVALID_TXID;
        inner.boundary_in_progress = false;
        self.changed.notify_all();
        drop(inner);

        tracing::info!("Finalized log segment [{}, {}]", segment_txid, end_txid);
        self.print_statistics(true);
        Ok(end_txid)
    }

    /// Ends the current segment and starts the next one. Returns the start
    /// of the new segment.
    pub fn roll_log(&self) -> Result<u64, LogError> {
        let end_txid = self.end_log_segment()?;
        let next = end_txid + 1;
        self.start_log_segment(next)?;
        Ok(next)
    }

    /// Abandons the open segment on every journal.
    ///
    /// Buffered transactions are dropped and their txids are never reused:
    /// the next segment starts after the last written txid, and syncing a
    /// dropped txid fails with [`LogError::Discarded`].
    pub fn abort_current_segment(&self) -> Result<(), LogError> {
        let start = {
            let mut inner = self.inner.lock();
            loop {
                inner.check_poisoned()?;
                if !inner.sync_in_progress && !inner.boundary_in_progress {
                    break;
                }
                self.changed.wait_for(&mut inner, WAIT_INTERVAL);
            }
            inner
                .state
                .require("abort log segment", &[LogState::InSegment])?;

            let dropped = inner.buffer.clear();
            if inner.synctxid < inner.txid {
                inner.discarded = Some((inner.synctxid + 1, inner.txid));
            }
            inner.boundary_in_progress = true;
            tracing::warn!(
                "Aborting log segment {} (last written txid {}, {} unsynced transactions dropped)",
                inner.cur_segment_txid,
                inner.txid,
                dropped
            );
            inner.cur_segment_txid
        };

        let aborted = self.journals.abort_segment(start);

        let mut inner = self.inner.lock();
        inner.cur_segment_txid = INVALID_TXID;
        inner.state = LogState::BetweenSegments;
        inner.boundary_in_progress = false;
        self.changed.notify_all();
        aborted.map_err(LogError::from)
    }

    /// Appends a transaction and returns its txid. Does not wait for
    /// durability.
    pub fn append_transaction(&self, payload: impl Into<Bytes>) -> Result<Appended, LogError> {
        let mut inner = self.inner.lock();
        self.append_guarded(&mut inner, payload.into(), false, false)
    }

    /// Like [`EditLog::append_transaction`], but always asks for a sync.
    pub fn append_transaction_forced(
        &self,
        payload: impl Into<Bytes>,
    ) -> Result<Appended, LogError> {
        let mut inner = self.inner.lock();
        self.append_guarded(&mut inner, payload.into(), true, false)
    }

    /// Appends a transaction and syncs right away if the buffer policy asks
    /// for it.
    ///
    /// While such an automatic sync is pending, other `log_edit` callers
    /// wait, so a full buffer is drained before it grows further.
    pub fn log_edit(&self, payload: impl Into<Bytes>) -> Result<u64, LogError> {
        let txid = {
            let mut inner = self.inner.lock();
            let appended = self.append_guarded(&mut inner, payload.into(), false, true)?;
            if !appended.needs_sync {
                return Ok(appended.txid);
            }
            inner.auto_sync_scheduled = true;
            appended.txid
        };

        let result = self.sync(txid);

        let mut inner = self.inner.lock();
        inner.auto_sync_scheduled = false;
        self.changed.notify_all();
        result.map(|()| txid)
    }

    /// Blocks until `txid` is durable on a quorum of journals.
    ///
    /// A flush that cannot reach a quorum is fatal: the log is poisoned, the
    /// fatal handler runs and `LogError::Fatal` is returned to every waiter.
    pub fn sync(&self, txid: u64) -> Result<(), LogError> {
        let (batch, sync_start, batched) = {
            let mut inner = self.inner.lock();
            loop {
                inner.check_poisoned()?;
                inner.check_discarded(txid)?;
                if txid <= inner.synctxid {
                    return Ok(());
                }
                if txid > inner.txid {
                    return Err(LogError::IllegalArgument(format!(
                        "cannot sync txid {} beyond last written txid {}",
                        txid, inner.txid
                    )));
                }
                if !inner.sync_in_progress {
                    break;
                }
                self.changed.wait_for(&mut inner, WAIT_INTERVAL);
            }

            let sync_start = inner.txid;
            inner.sync_in_progress = true;
            let batch = inner.buffer.take();
            let batched = batch.as_ref().map_or(0, |b| b.num_txns.saturating_sub(1));
            (batch, sync_start, batched)
        };

        let started = Instant::now();
        let bytes = batch.as_ref().map(|b| b.data.len() as u64).unwrap_or(0);
        let first_txid = batch.as_ref().map(|b| b.first_txid);
        let result = match batch {
            Some(batch) => self.journals.write(batch),
            None => Ok(()),
        };

        let mut inner = self.inner.lock();
        inner.sync_in_progress = false;
        match result {
            Ok(()) => {
                inner.synctxid = sync_start;
                inner.last_sync = Instant::now();
                self.stats.record_sync(batched, bytes, started.elapsed());
                self.changed.notify_all();
                drop(inner);
                tracing::debug!(
                    "Synced through txid {} in {} ms ({} batched)",
                    sync_start,
                    started.elapsed().as_millis(),
                    batched
                );
                self.print_statistics(false);
                Ok(())
            }
            Err(e) => {
                let reason = format!(
                    "could not sync txids {}-{} to a quorum of journals: {}",
                    first_txid.unwrap_or(sync_start),
                    sync_start,
                    e
                );
                Err(self.fail(inner, reason))
            }
        }
    }

    /// Syncs through the last written txid.
    pub fn sync_all(&self) -> Result<(), LogError> {
        let txid = self.inner.lock().txid;
        self.sync(txid)
    }

    /// Blocks while a flush is running.
    pub fn wait_for_sync_to_finish(&self) {
        let mut inner = self.inner.lock();
        while inner.sync_in_progress {
            self.changed.wait_for(&mut inner, WAIT_INTERVAL);
        }
    }

    /// Appends an externally produced batch and syncs it. The batch must
    /// start at `last_written_txid + 1`. Returns its last txid.
    pub fn journal_batch(&self, batch: TxBatch) -> Result<u64, LogError> {
        let last_txid = {
            let mut inner = self.inner.lock();
            self.wait_for_boundary(&mut inner)?;
            inner
                .state
                .require("journal batch", &[LogState::InSegment])?;
            if batch.is_empty() {
                return Err(LogError::IllegalArgument(
                    "cannot journal an empty batch".to_string(),
                ));
            }
            if batch.first_txid != inner.txid + 1 {
                return Err(LogError::IllegalArgument(format!(
                    "received txid {} out of order, expected {}",
                    batch.first_txid,
                    inner.txid + 1
                )));
            }
            batch.decode()?;

            let started = Instant::now();
            inner.buffer.write_batch(&batch)?;
            inner.txid = batch.last_txid();
            self.stats
                .record_batch_append(batch.num_txns, started.elapsed());
            inner.txid
        };

        self.sync(last_txid)?;
        Ok(last_txid)
    }

    /// Deletes finalized segments that end before `min_txid`.
    pub fn purge_logs_older_than(&self, min_txid: u64) -> Result<(), LogError> {
        {
            let inner = self.inner.lock();
            inner.check_poisoned()?;
            if !inner.state.is_open_for_write() {
                return Err(LogError::InvalidState {
                    operation: "purge logs",
                    state: inner.state,
                });
            }
            if inner.cur_segment_txid != INVALID_TXID && min_txid > inner.cur_segment_txid {
                return Err(LogError::IllegalArgument(format!(
                    "cannot purge logs older than txid {} when current segment starts at {}",
                    min_txid, inner.cur_segment_txid
                )));
            }
        }
        self.journals.purge(min_txid)?;
        Ok(())
    }

    /// Lists readable segments ending at or after `from_txid`.
    pub fn select_segments(
        &self,
        from_txid: u64,
        in_progress_ok: bool,
    ) -> Result<Vec<LogSegment>, LogError> {
        self.require_readable("select segments")?;
        Ok(self.journals.select_segments(from_txid, in_progress_ok)?)
    }

    /// Reads transactions from `from_txid`, failing with a gap error unless
    /// everything through `to_at_least` is available (0 accepts any end).
    pub fn read_from(
        &self,
        from_txid: u64,
        to_at_least: u64,
        in_progress_ok: bool,
    ) -> Result<ReadOutcome, LogError> {
        self.require_readable("read transactions")?;
        Ok(self
            .journals
            .read_from(from_txid, to_at_least, in_progress_ok)?)
    }

    /// Logs statistics, at most once per configured interval unless forced.
    pub fn print_statistics(&self, force: bool) {
        let snapshot = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            if !force && now.duration_since(inner.last_stats_print) < self.config.stats_interval {
                return;
            }
            inner.last_stats_print = now;
            self.stats.snapshot(inner.txid, inner.synctxid)
        };
        tracing::info!("{}", snapshot);
    }

    /// Drains any running flush, ends the open segment and closes the log.
    ///
    /// The journal set stays open; its owner closes it.
    pub fn close(&self) -> Result<(), LogError> {
        if self.state() == LogState::Closed {
            return Ok(());
        }
        self.wait_for_sync_to_finish();

        let (state, poisoned) = {
            let mut inner = self.inner.lock();
            let _ = self.wait_for_boundary(&mut inner);
            (inner.state, inner.poisoned.clone())
        };
        let result = match poisoned {
            Some(reason) => Err(LogError::Fatal(reason)),
            None if state == LogState::InSegment => self.end_log_segment().map(|_| ()),
            None => Ok(()),
        };

        let mut inner = self.inner.lock();
        inner.state = LogState::Closed;
        inner.cur_segment_txid = INVALID_TXID;
        self.changed.notify_all();
        tracing::info!("Edit log closed at txid {}", inner.txid);
        result
    }

    fn append_guarded(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        payload: Bytes,
        force: bool,
        wait_auto_sync: bool,
    ) -> Result<Appended, LogError> {
        loop {
            inner.check_poisoned()?;
            if !inner.boundary_in_progress && !(wait_auto_sync && inner.auto_sync_scheduled) {
                break;
            }
            self.changed.wait_for(inner, WAIT_INTERVAL);
        }
        inner
            .state
            .require("append transaction", &[LogState::InSegment])?;

        let txid = self.append_locked(inner, TxKind::Op, payload)?;
        let needs_sync = force || self.should_force_sync(inner);
        Ok(Appended { txid, needs_sync })
    }

    fn append_locked(&self, inner: &mut Inner, kind: TxKind, payload: Bytes) -> Result<u64, LogError> {
        let started = Instant::now();
        let txid = inner.txid + 1;
        inner.buffer.write(&Transaction::new(txid, kind, payload))?;
        inner.txid = txid;
        self.stats.record_append(started.elapsed());
        Ok(txid)
    }

    fn should_force_sync(&self, inner: &Inner) -> bool {
        if inner.buffer.is_full() {
            return true;
        }
        !self.config.sync_period.is_zero()
            && !inner.buffer.is_empty()
            && inner.last_sync.elapsed() >= self.config.sync_period
    }

    fn wait_for_boundary(&self, inner: &mut MutexGuard<'_, Inner>) -> Result<(), LogError> {
        loop {
            inner.check_poisoned()?;
            if !inner.boundary_in_progress {
                return Ok(());
            }
            self.changed.wait_for(inner, WAIT_INTERVAL);
        }
    }

    fn finish_boundary(&self) {
        let mut inner = self.inner.lock();
        inner.boundary_in_progress = false;
        self.changed.notify_all();
    }

    fn require_readable(&self, operation: &'static str) -> Result<(), LogError> {
        let state = self.inner.lock().state;
        if state.is_readable() {
            Ok(())
        } else {
            Err(LogError::InvalidState { operation, state })
        }
    }

    /// Poisons the log and runs the fatal handler on the first failure.
    fn fail(&self, mut inner: MutexGuard<'_, Inner>, reason: String) -> LogError {
        let first = inner.poisoned.is_none();
        if first {
            inner.poisoned = Some(reason.clone());
        }
        inner.boundary_in_progress = false;
        inner.auto_sync_scheduled = false;
        self.changed.notify_all();
        drop(inner);

        if first {
            self.fatal.on_fatal(&reason);
        }
        LogError::Fatal(reason)
    }
}
