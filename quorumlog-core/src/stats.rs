//! Edit log statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters updated by the edit log.
#[derive(Debug, Default)]
pub struct LogStats {
    transactions: AtomicU64,
    append_time_us: AtomicU64,
    syncs: AtomicU64,
    sync_time_us: AtomicU64,
    batched_in_sync: AtomicU64,
    bytes_synced: AtomicU64,
}

/// Point-in-time copy of [`LogStats`] plus the log watermarks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStatsSnapshot {
    /// Transactions appended.
    pub transactions: u64,
    /// Time spent appending, in microseconds.
    pub append_time_us: u64,
    /// Flushes that reached the journals.
    pub syncs: u64,
    /// Time spent flushing, in microseconds.
    pub sync_time_us: u64,
    /// Transactions that rode along in another caller's sync.
    pub batched_in_sync: u64,
    /// Bytes handed to the journals.
    pub bytes_synced: u64,
    /// Last assigned txid.
    pub last_written_txid: u64,
    /// Last durable txid.
    pub synced_txid: u64,
}

impl LogStats {
    pub fn record_append(&self, elapsed: Duration) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        self.append_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_batch_append(&self, txns: u64, elapsed: Duration) {
        self.transactions.fetch_add(txns, Ordering::Relaxed);
        self.append_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_sync(&self, batched: u64, bytes: u64, elapsed: Duration) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        self.batched_in_sync.fetch_add(batched, Ordering::Relaxed);
        self.bytes_synced.fetch_add(bytes, Ordering::Relaxed);
        self.sync_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, last_written_txid: u64, synced_txid: u64) -> LogStatsSnapshot {
        LogStatsSnapshot {
            transactions: self.transactions.load(Ordering::Relaxed),
            append_time_us: self.append_time_us.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            sync_time_us: self.sync_time_us.load(Ordering::Relaxed),
            batched_in_sync: self.batched_in_sync.load(Ordering::Relaxed),
            bytes_synced: self.bytes_synced.load(Ordering::Relaxed),
            last_written_txid,
            synced_txid,
        }
    }
}

impl LogStatsSnapshot {
    /// Average sync time in milliseconds.
    pub fn avg_sync_ms(&self) -> f64 {
        if self.syncs == 0 {
            0.0
        } else {
            self.sync_time_us as f64 / self.syncs as f64 / 1000.0
        }
    }
}

impl std::fmt::Display for LogStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Number of transactions: {} Total time for transactions(ms): {} \
             Number of transactions batched in syncs: {} Number of syncs: {} \
             Average sync time(ms): {:.2} Last written txid: {} Synced txid: {}",
            self.transactions,
            self.append_time_us / 1000,
            self.batched_in_sync,
            self.syncs,
            self.avg_sync_ms(),
            self.last_written_txid,
            self.synced_txid
        )
    }
}
