//! # quorumlog-quorum
//!
//! Quorum response aggregation for quorumlog.
//!
//! A [`QuorumCall`] tracks a fixed set of keyed outstanding operations and
//! lets a caller block until enough of them have answered:
//! - Return on total responses, successes, or too many failures
//! - Deadlines that stretch when the waiting process itself was paused
//! - Periodic progress reporting while waiting
//! - Defect-class failures surface even when a quorum succeeded

pub mod call;
pub mod clock;
pub mod error;
pub mod policy;

pub use call::{CallError, QuorumCall, Settler};
pub use clock::{Clock, MonotonicClock, OffsetClock, Stopwatch};
pub use error::QuorumError;
pub use policy::QuorumPolicy;
