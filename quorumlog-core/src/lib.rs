//! # quorumlog-core
//!
//! The quorum-committed edit log.
//!
//! This crate provides:
//! - The segment lifecycle state machine ([`LogState`])
//! - [`EditLog`], which assigns transaction ids, buffers transactions and
//!   group-commits them to a [`quorumlog_journal::JournalSet`]
//! - Fatal-failure handling for lost durability
//! - Log statistics

pub mod buffer;
pub mod edit_log;
pub mod error;
pub mod fatal;
pub mod state;
pub mod stats;

pub use buffer::EditBuffer;
pub use edit_log::{Appended, EditLog, EditLogConfig};
pub use error::LogError;
pub use fatal::{ExitProcess, FatalHandler, RecordingFatalHandler};
pub use state::LogState;
pub use stats::{LogStats, LogStatsSnapshot};

/// Default size at which the write buffer asks for a sync (512 KiB).
pub const DEFAULT_SYNC_BUFFER_SIZE: usize = 512 * 1024;
