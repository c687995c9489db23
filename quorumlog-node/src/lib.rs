//! # quorumlog-node
//!
//! Node assembly for quorumlog.
//!
//! This crate provides:
//! - YAML and environment configuration
//! - Prometheus metrics mirrored from the edit log
//! - A directory-backed image store for reader bootstrap
//! - Writer role revocation driven by liveness notifications
//! - Periodic log tailing for readers

pub mod config;
pub mod error;
pub mod image;
pub mod liveness;
pub mod metrics;
pub mod node;
pub mod tailer;

pub use config::{
    Config, ConfigError, ImageConfig, JournalConfig, LogConfig, MetricsConfig, QuorumConfig,
    TailerConfig,
};
pub use error::NodeError;
pub use image::{DirImageStore, ImageMeta, ImageTransfer};
pub use liveness::{Role, RoleController, ServiceHealth};
pub use metrics::{run_metrics_server, Metrics};
pub use node::Node;
pub use tailer::LogTailer;
