//! The journal set: quorum fan-out over redundant targets.
//!
//! Every mutating operation is submitted to all targets at once and the
//! caller waits until enough of them acknowledge. A write is durable once
//! `minimum_redundant_targets` targets have it; the remaining targets may
//! be slow, failing or gone without affecting the caller.

use crate::channel::TargetChannel;
use crate::error::JournalError;
use crate::record::{Transaction, TxBatch};
use crate::segment::{LogSegment, SegmentStatus};
use crate::target::{JournalTarget, WriteAck};
use parking_lot::Mutex;
use quorumlog_quorum::{Clock, MonotonicClock, QuorumCall, QuorumError, QuorumPolicy, Settler};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default time to wait for a write quorum.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default time to wait for segment start/finalize and recovery.
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default bytes of writes that may wait for one target before it is
/// considered too far behind.
pub const DEFAULT_MAX_QUEUED_BYTES: u64 = 10 * 1024 * 1024;

/// Journal set configuration.
#[derive(Debug, Clone)]
pub struct JournalSetConfig {
    /// Acknowledgments required for an operation to succeed.
    pub minimum_redundant_targets: usize,
    /// Quorum wait for writes.
    pub write_timeout: Duration,
    /// Quorum wait for segment and recovery operations.
    pub segment_timeout: Duration,
    /// Pause detection and progress reporting thresholds.
    pub policy: QuorumPolicy,
    /// Bytes of writes queued for a single target beyond which its writes
    /// fail fast until the next segment start.
    pub max_queued_bytes: u64,
}

impl JournalSetConfig {
    pub fn new(minimum_redundant_targets: usize) -> Self {
        Self {
            minimum_redundant_targets,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            segment_timeout: DEFAULT_SEGMENT_TIMEOUT,
            policy: QuorumPolicy::default(),
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: QuorumPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_queued_bytes(mut self, bytes: u64) -> Self {
        self.max_queued_bytes = bytes;
        self
    }
}

impl Default for JournalSetConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Transactions read back from the set.
#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    /// Transactions in txid order, starting at the requested txid.
    pub transactions: Vec<Transaction>,
    /// Segments the transactions were read from.
    pub segments: Vec<LogSegment>,
}

impl ReadOutcome {
    /// Last txid read, if any.
    pub fn last_txid(&self) -> Option<u64> {
        self.transactions.last().map(|t| t.txid)
    }
}

/// A segment as reported by one target.
#[derive(Debug, Clone, Copy)]
struct SegmentSource {
    segment: LogSegment,
    channel: usize,
}

/// Redundant collection of journal targets.
pub struct JournalSet {
    channels: Vec<TargetChannel>,
    config: JournalSetConfig,
    clock: Arc<dyn Clock>,
    current_segment: Mutex<Option<u64>>,
    quorum_timeouts: AtomicU64,
}

impl JournalSet {
    /// Creates a set over `targets`, starting one worker per target.
    pub fn new(
        targets: Vec<Arc<dyn JournalTarget>>,
        config: JournalSetConfig,
    ) -> Result<Self, JournalError> {
        let n = targets.len();
        let q = config.minimum_redundant_targets;
        if n == 0 {
            return Err(JournalError::InvalidState(
                "journal set needs at least one target".to_string(),
            ));
        }
        if q == 0 || q > n {
            return Err(JournalError::InvalidState(format!(
                "minimum redundant targets must be in [1, {}], got {}",
                n, q
            )));
        }
        config.policy.validate().map_err(JournalError::InvalidState)?;

        let mut ids = HashSet::new();
        for target in &targets {
            if !ids.insert(target.id().to_string()) {
                return Err(JournalError::InvalidState(format!(
                    "duplicate journal target id: {}",
                    target.id()
                )));
            }
        }

        if q * 2 <= n {
            tracing::warn!(
                "Minimum redundant targets {} is not a majority of {} targets",
                q,
                n
            );
        }

        let channels = targets
            .into_iter()
            .map(|target| TargetChannel::spawn(target, config.max_queued_bytes))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!("Journal set created: {} targets, quorum {}", n, q);

        Ok(Self {
            channels,
            config,
            clock: Arc::new(MonotonicClock),
            current_segment: Mutex::new(None),
            quorum_timeouts: AtomicU64::new(0),
        })
    }

    /// Replaces the clock used for quorum deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &JournalSetConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Target ids in configuration order.
    pub fn target_ids(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.id().to_string()).collect()
    }

    /// Targets currently refusing writes until the next segment.
    pub fn out_of_sync_targets(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|c| c.is_out_of_sync())
            .map(|c| c.id().to_string())
            .collect()
    }

    /// Number of quorum waits that ended in a timeout.
    pub fn quorum_timeouts(&self) -> u64 {
        self.quorum_timeouts.load(Ordering::Relaxed)
    }

    /// Start of the segment currently open on the set.
    pub fn current_segment(&self) -> Option<u64> {
        *self.current_segment.lock()
    }

    /// Formats every target. All targets must succeed.
    pub fn format(&self) -> Result<(), JournalError> {
        let n = self.channels.len();
        self.fan_out(
            "format",
            n,
            self.config.segment_timeout,
            |channel, settler| channel.submit(settler, |t| t.format()),
        )?;
        Ok(())
    }

    /// Starts a segment on a quorum of targets.
    pub fn start_segment(&self, start_txid: u64) -> Result<(), JournalError> {
        let operation = format!("start segment {}", start_txid);
        self.fan_out(
            &operation,
            self.config.minimum_redundant_targets,
            self.config.segment_timeout,
            |channel, settler| channel.start_segment(settler, start_txid),
        )?;
        *self.current_segment.lock() = Some(start_txid);
        Ok(())
    }

    /// Durably writes a batch to the open segment on a quorum of targets.
    pub fn write(&self, batch: TxBatch) -> Result<(), JournalError> {
        let segment_start = self.current_segment().ok_or_else(|| {
            JournalError::Defect(format!(
                "write of txid {} with no open segment",
                batch.first_txid
            ))
        })?;
        let operation = format!("write txids {}-{}", batch.first_txid, batch.last_txid());
        self.fan_out::<WriteAck, _>(
            &operation,
            self.config.minimum_redundant_targets,
            self.config.write_timeout,
            |channel, settler| channel.write(settler, segment_start, batch.clone()),
        )?;
        Ok(())
    }

    /// Finalizes the open segment as `[start_txid, end_txid]` on a quorum.
    pub fn finalize_segment(&self, start_txid: u64, end_txid: u64) -> Result<(), JournalError> {
        let operation = format!("finalize segment [{}, {}]", start_txid, end_txid);
        self.fan_out(
            &operation,
            self.config.minimum_redundant_targets,
            self.config.segment_timeout,
            |channel, settler| {
                channel.submit(settler, move |t| t.finalize_segment(start_txid, end_txid))
            },
        )?;
        *self.current_segment.lock() = None;
        Ok(())
    }

    /// Abandons the open segment on every target. Failures are logged only.
    pub fn abort_segment(&self, start_txid: u64) -> Result<(), JournalError> {
        let operation = format!("abort segment {}", start_txid);
        let results = self.broadcast::<(), _>(&operation, self.config.segment_timeout, |channel, settler| {
            channel.submit(settler, move |t| t.abort_segment(start_txid))
        });
        if results.is_empty() {
            tracing::warn!("No journal acknowledged {}", operation);
        }
        *self.current_segment.lock() = None;
        Ok(())
    }

    /// Finalizes or aborts in-progress segments left by a crash.
    ///
    /// Returns the highest txid found in any finalized segment of the
    /// responding targets, or `None` if the set holds no transactions.
    pub fn recover_unfinalized(&self) -> Result<Option<u64>, JournalError> {
        let recovered = self.fan_out::<Vec<LogSegment>, _>(
            "recover unfinalized segments",
            self.config.minimum_redundant_targets,
            self.config.segment_timeout,
            |channel, settler| channel.submit(settler, |t| t.recover_unfinalized()),
        )?;
        for (target, segments) in &recovered {
            for segment in segments {
                tracing::info!("Journal {} recovered segment {}", target, segment);
            }
        }
        *self.current_segment.lock() = None;

        Ok(self
            .select_segments(0, false)?
            .iter()
            .map(|s| s.end_txid)
            .max())
    }

    /// Returns the merged segment manifest of the set, ordered by start txid.
    ///
    /// For each start txid the longest copy wins, finalized over in-progress.
    pub fn select_segments(
        &self,
        from_txid: u64,
        in_progress_ok: bool,
    ) -> Result<Vec<LogSegment>, JournalError> {
        Ok(self
            .manifest(from_txid, in_progress_ok)?
            .into_values()
            .filter_map(|sources| sources.first().map(|s| s.segment))
            .collect())
    }

    /// Reads transactions starting at `from_txid`.
    ///
    /// Every txid from `from_txid` through `to_at_least` must be readable
    /// (pass 0 to accept whatever is available); otherwise `Gap` is returned.
    pub fn read_from(
        &self,
        from_txid: u64,
        to_at_least: u64,
        in_progress_ok: bool,
    ) -> Result<ReadOutcome, JournalError> {
        let manifest = self.manifest(from_txid, in_progress_ok)?;
        let mut outcome = ReadOutcome::default();
        let mut next = from_txid;

        for sources in manifest.values() {
            let Some(best) = sources.first() else {
                continue;
            };
            if best.segment.end_txid < next {
                continue;
            }
            if best.segment.start_txid > next {
                break;
            }

            let txns = self.read_segment(sources, next)?;
            if let Some(last) = txns.last() {
                next = last.txid + 1;
            }
            outcome.transactions.extend(txns);
            outcome.segments.push(best.segment);
        }

        if to_at_least != 0 && next <= to_at_least {
            return Err(JournalError::Gap {
                missing: next,
                requested: to_at_least,
            });
        }
        Ok(outcome)
    }

    /// Deletes finalized segments below `min_txid` on every target.
    pub fn purge(&self, min_txid: u64) -> Result<(), JournalError> {
        let operation = format!("purge segments below {}", min_txid);
        let purged = self.broadcast::<usize, _>(&operation, self.config.segment_timeout, |channel, settler| {
            channel.submit(settler, move |t| t.purge_before(min_txid))
        });
        for (target, count) in purged {
            if count > 0 {
                tracing::info!("Journal {} purged {} segments below txid {}", target, count, min_txid);
            }
        }
        Ok(())
    }

    /// Closes every target and stops the workers.
    pub fn close(&self) -> Result<(), JournalError> {
        self.broadcast::<(), _>("close", self.config.segment_timeout, |channel, settler| {
            channel.submit(settler, |t| t.close())
        });
        for channel in &self.channels {
            channel.close();
        }
        Ok(())
    }

    fn new_call<R>(&self) -> QuorumCall<String, R, JournalError>
    where
        R: Clone + std::fmt::Debug + Send + 'static,
    {
        QuorumCall::with_clock(self.target_ids(), self.config.policy, Arc::clone(&self.clock))
    }

    /// Submits to every target and waits until `required` succeed, all
    /// respond, or success becomes impossible.
    fn fan_out<R, F>(
        &self,
        operation: &str,
        required: usize,
        timeout: Duration,
        submit: F,
    ) -> Result<HashMap<String, R>, JournalError>
    where
        R: Clone + std::fmt::Debug + Send + 'static,
        F: Fn(&TargetChannel, Settler<String, R, JournalError>),
    {
        let call = self.new_call::<R>();
        for channel in &self.channels {
            if let Some(settler) = call.settler(&channel.id().to_string()) {
                submit(channel, settler);
            }
        }

        let n = self.channels.len();
        if let Err(e) = call.wait_for(n, required, n - required, timeout, operation) {
            if e.is_timeout() {
                self.quorum_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            return Err(e.into());
        }

        if call.count_successes() >= required {
            for key in call.failed_keys() {
                tracing::warn!("Journal {} failed {}; continuing with quorum", key, operation);
            }
            return Ok(call.snapshot_successes());
        }

        let error = call
            .aggregate_failure(format!("{} failed on too many journals", operation))
            .unwrap_or_else(|| QuorumError::Failed {
                message: format!("{} did not reach quorum", operation),
                successes: Vec::new(),
                failures: Vec::new(),
            });
        tracing::error!("{}", error);
        Err(error.into())
    }

    /// Submits to every target and waits for all of them (or the timeout),
    /// returning whatever succeeded. Failures are logged.
    fn broadcast<R, F>(&self, operation: &str, timeout: Duration, submit: F) -> HashMap<String, R>
    where
        R: Clone + std::fmt::Debug + Send + 'static,
        F: Fn(&TargetChannel, Settler<String, R, JournalError>),
    {
        let call = self.new_call::<R>();
        for channel in &self.channels {
            if let Some(settler) = call.settler(&channel.id().to_string()) {
                submit(channel, settler);
            }
        }

        let n = self.channels.len();
        if let Err(e) = call.wait_for(n, 0, n, timeout, operation) {
            tracing::warn!("{}", e);
        }
        if let Some(failure) = call.aggregate_failure(format!("{} failed on some journals", operation)) {
            tracing::warn!("{}", failure);
        }
        call.snapshot_successes()
    }

    /// Collects segments from every responding target, grouped by start
    /// txid with the preferred copy first.
    fn manifest(
        &self,
        from_txid: u64,
        in_progress_ok: bool,
    ) -> Result<BTreeMap<u64, Vec<SegmentSource>>, JournalError> {
        let operation = format!("list segments from {}", from_txid);
        let listed = self.broadcast::<Vec<LogSegment>, _>(&operation, self.config.write_timeout, |channel, settler| {
            channel.submit(settler, move |t| t.segments(from_txid, in_progress_ok))
        });
        if listed.is_empty() {
            return Err(JournalError::Unavailable {
                target: "journal set".to_string(),
                reason: format!("no journal answered {}", operation),
            });
        }

        let index: HashMap<&str, usize> = self
            .channels
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id(), i))
            .collect();

        let mut manifest: BTreeMap<u64, Vec<SegmentSource>> = BTreeMap::new();
        for (target, segments) in &listed {
            let Some(&channel) = index.get(target.as_str()) else {
                continue;
            };
            for segment in segments {
                manifest
                    .entry(segment.start_txid)
                    .or_default()
                    .push(SegmentSource {
                        segment: *segment,
                        channel,
                    });
            }
        }

        for sources in manifest.values_mut() {
            sources.sort_by_key(|s| {
                (
                    std::cmp::Reverse(s.segment.end_txid),
                    s.segment.status != SegmentStatus::Finalized,
                    s.channel,
                )
            });
        }
        Ok(manifest)
    }

    /// Reads one segment from the first source that can serve it.
    fn read_segment(
        &self,
        sources: &[SegmentSource],
        from_txid: u64,
    ) -> Result<Vec<Transaction>, JournalError> {
        let mut last_error: Option<JournalError> = None;
        for source in sources {
            if source.segment.end_txid < from_txid {
                break;
            }
            let channel = &self.channels[source.channel];
            let key = channel.id().to_string();
            let call = QuorumCall::<String, Vec<Transaction>, JournalError>::with_clock(
                [key.clone()],
                self.config.policy,
                Arc::clone(&self.clock),
            );
            let Some(settler) = call.settler(&key) else {
                continue;
            };
            let start = source.segment.start_txid;
            channel.submit(settler, move |t| t.read_segment(start));

            let operation = format!("read segment {} from {}", start, key);
            if let Err(e) = call.wait_for(1, 0, 0, self.config.write_timeout, &operation) {
                tracing::warn!("{}", e);
                last_error = Some(e.into());
                continue;
            }
            match call.snapshot_successes().remove(&key) {
                Some(txns) => {
                    return Ok(txns.into_iter().filter(|t| t.txid >= from_txid).collect());
                }
                None => {
                    if let Some(e) = call.aggregate_failure(operation) {
                        tracing::warn!("{}", e);
                        last_error = Some(e.into());
                    }
                }
            }
        }
        Err(last_error.unwrap_or(JournalError::Gap {
            missing: from_txid,
            requested: from_txid,
        }))
    }
}
