//! # quorumlog-journal
//!
//! Journal targets for quorumlog.
//!
//! This crate provides:
//! - The transaction record format with per-record checksums
//! - The [`JournalTarget`] trait implemented by every replica
//! - A directory-backed target and an in-memory target with fault injection
//! - Recovery of torn segment tails
//! - [`JournalSet`], which fans each operation out to all targets and waits
//!   for a quorum of acknowledgments

pub mod channel;
pub mod error;
pub mod file;
pub mod memory;
pub mod record;
pub mod recovery;
pub mod segment;
pub mod set;
pub mod target;

pub use channel::TargetChannel;
pub use error::JournalError;
pub use file::FileJournal;
pub use memory::{Fault, MemoryJournal};
pub use record::{Transaction, TxBatch, TxKind, TxRecord};
pub use segment::{LogSegment, SegmentStatus};
pub use set::{JournalSet, JournalSetConfig, ReadOutcome};
pub use target::{JournalTarget, WriteAck};

/// Record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Transaction id meaning "no transaction".
pub const INVALID_TXID: u64 = 0;

/// Layout version written to a formatted journal directory.
pub const LAYOUT_VERSION: u32 = 1;
