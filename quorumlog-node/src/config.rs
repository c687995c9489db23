//! Node configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via QUORUMLOG_CONFIG)
//! 3. Environment variables

use quorumlog_core::EditLogConfig;
use quorumlog_journal::JournalSetConfig;
use quorumlog_quorum::QuorumPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Journal targets and quorum size.
    pub journal: JournalConfig,
    /// Edit log buffering and statistics.
    pub log: LogConfig,
    /// Quorum wait tuning.
    pub quorum: QuorumConfig,
    /// Image store.
    pub image: ImageConfig,
    /// Reader tailing.
    pub tailer: TailerConfig,
    /// Metrics endpoint.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("QUORUMLOG_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.journal.apply_env_overrides();
        self.log.apply_env_overrides();
        self.quorum.apply_env_overrides();
        self.image.apply_env_overrides();
        self.tailer.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks the configuration for values the log cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.journal.validate()?;
        self.quorum
            .policy()
            .validate()
            .map_err(ConfigError::ValidationError)?;
        if self.log.sync_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "log.sync_buffer_size must be positive".to_string(),
            ));
        }
        if self.tailer.period_ms == 0 {
            return Err(ConfigError::ValidationError(
                "tailer.period_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Journal set settings derived from this configuration.
    pub fn journal_set_config(&self) -> JournalSetConfig {
        JournalSetConfig::new(self.journal.minimum_redundant_targets)
            .with_write_timeout(self.journal.rpc_timeout())
            .with_segment_timeout(self.journal.segment_timeout())
            .with_policy(self.quorum.policy())
            .with_max_queued_bytes(self.journal.queued_edits_limit_bytes())
    }

    /// Edit log settings derived from this configuration.
    pub fn edit_log_config(&self) -> EditLogConfig {
        EditLogConfig::default()
            .with_sync_buffer_size(self.log.sync_buffer_size)
            .with_sync_period(self.log.sync_period())
            .with_stats_interval(self.log.stats_interval())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Base directory for journal targets without an explicit directory.
    pub data_dir: PathBuf,
    /// Number of journal targets.
    pub target_count: usize,
    /// Acknowledgments required for each write.
    pub minimum_redundant_targets: usize,
    /// Explicit target directories. Overrides `data_dir` and `target_count`.
    pub dirs: Vec<PathBuf>,
    /// Timeout for a quorum write, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// Timeout for segment start, finalize and recovery, in milliseconds.
    pub segment_timeout_ms: u64,
    /// Bytes of writes that may queue for one lagging target, in MiB.
    pub queued_edits_limit_mb: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            target_count: 3,
            minimum_redundant_targets: 2,
            dirs: Vec::new(),
            rpc_timeout_ms: 20_000,
            segment_timeout_ms: 20_000,
            queued_edits_limit_mb: 10,
        }
    }
}

impl JournalConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("QUORUMLOG_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(count) = std::env::var("QUORUMLOG_JOURNAL_TARGETS") {
            if let Ok(n) = count.parse() {
                self.target_count = n;
            }
        }

        if let Ok(quorum) = std::env::var("QUORUMLOG_JOURNAL_QUORUM") {
            if let Ok(n) = quorum.parse() {
                self.minimum_redundant_targets = n;
            }
        }

        if let Ok(dirs) = std::env::var("QUORUMLOG_JOURNAL_DIRS") {
            self.dirs = dirs
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Ok(timeout) = std::env::var("QUORUMLOG_RPC_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.rpc_timeout_ms = ms;
            }
        }

        if let Ok(timeout) = std::env::var("QUORUMLOG_SEGMENT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.segment_timeout_ms = ms;
            }
        }

        if let Ok(limit) = std::env::var("QUORUMLOG_QUEUED_EDITS_LIMIT_MB") {
            if let Ok(mb) = limit.parse() {
                self.queued_edits_limit_mb = mb;
            }
        }
    }

    /// Returns the directory of every journal target.
    pub fn journal_dirs(&self) -> Vec<PathBuf> {
        if !self.dirs.is_empty() {
            return self.dirs.clone();
        }
        (0..self.target_count)
            .map(|i| self.data_dir.join(format!("journal-{}", i)))
            .collect()
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.segment_timeout_ms)
    }

    pub fn queued_edits_limit_bytes(&self) -> u64 {
        self.queued_edits_limit_mb * 1024 * 1024
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let targets = self.journal_dirs().len();
        if targets == 0 {
            return Err(ConfigError::ValidationError(
                "at least one journal target is required".to_string(),
            ));
        }
        if self.minimum_redundant_targets == 0 || self.minimum_redundant_targets > targets {
            return Err(ConfigError::ValidationError(format!(
                "journal.minimum_redundant_targets must be between 1 and {}, got {}",
                targets, self.minimum_redundant_targets
            )));
        }
        if self.rpc_timeout_ms == 0 || self.segment_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "journal timeouts must be positive".to_string(),
            ));
        }
        if self.queued_edits_limit_mb == 0 {
            return Err(ConfigError::ValidationError(
                "journal.queued_edits_limit_mb must be positive".to_string(),
            ));
        }
        if self.minimum_redundant_targets * 2 <= targets {
            tracing::warn!(
                "Quorum of {} out of {} journal targets is not a majority; two writers could both make progress",
                self.minimum_redundant_targets,
                targets
            );
        }
        Ok(())
    }
}

/// Edit log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Buffered bytes at which a sync is requested.
    pub sync_buffer_size: usize,
    /// Age of buffered edits at which a sync is requested (0 = disabled).
    pub sync_period_ms: u64,
    /// Minimum interval between statistics reports, in seconds.
    pub stats_interval_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            sync_buffer_size: quorumlog_core::DEFAULT_SYNC_BUFFER_SIZE,
            sync_period_ms: 5_000,
            stats_interval_secs: 60,
        }
    }
}

impl LogConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("QUORUMLOG_SYNC_BUFFER_SIZE") {
            if let Ok(n) = size.parse() {
                self.sync_buffer_size = n;
            }
        }

        if let Ok(period) = std::env::var("QUORUMLOG_SYNC_PERIOD_MS") {
            if let Ok(ms) = period.parse() {
                self.sync_period_ms = ms;
            }
        }

        if let Ok(interval) = std::env::var("QUORUMLOG_STATS_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.stats_interval_secs = secs;
            }
        }
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_millis(self.sync_period_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Quorum wait configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Stall fraction of a timeout treated as a local process pause.
    pub pause_detection_threshold_fraction: f64,
    /// Fraction of a timeout after which progress is logged.
    pub progress_info_fraction: f64,
    /// Fraction of a timeout after which progress is logged as a warning.
    pub progress_warn_fraction: f64,
    /// Interval between progress reports, in milliseconds.
    pub progress_interval_ms: u64,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        let policy = QuorumPolicy::default();
        Self {
            pause_detection_threshold_fraction: policy.pause_threshold_fraction,
            progress_info_fraction: policy.progress_info_fraction,
            progress_warn_fraction: policy.progress_warn_fraction,
            progress_interval_ms: policy.progress_interval.as_millis() as u64,
        }
    }
}

impl QuorumConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(fraction) = std::env::var("QUORUMLOG_PAUSE_THRESHOLD") {
            if let Ok(f) = fraction.parse() {
                self.pause_detection_threshold_fraction = f;
            }
        }

        if let Ok(fraction) = std::env::var("QUORUMLOG_PROGRESS_INFO") {
            if let Ok(f) = fraction.parse() {
                self.progress_info_fraction = f;
            }
        }

        if let Ok(fraction) = std::env::var("QUORUMLOG_PROGRESS_WARN") {
            if let Ok(f) = fraction.parse() {
                self.progress_warn_fraction = f;
            }
        }

        if let Ok(interval) = std::env::var("QUORUMLOG_PROGRESS_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.progress_interval_ms = ms;
            }
        }
    }

    pub fn policy(&self) -> QuorumPolicy {
        QuorumPolicy::default()
            .with_pause_threshold_fraction(self.pause_detection_threshold_fraction)
            .with_progress_fractions(self.progress_info_fraction, self.progress_warn_fraction)
            .with_progress_interval(Duration::from_millis(self.progress_interval_ms))
    }
}

/// Image store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Directory holding images. Disabled when unset.
    pub dir: Option<PathBuf>,
}

impl ImageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("QUORUMLOG_IMAGE_DIR") {
            self.dir = Some(PathBuf::from(dir));
        }
    }
}

/// Log tailer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailerConfig {
    /// Poll period, in milliseconds.
    pub period_ms: u64,
    /// Whether to read from segments still being written.
    pub in_progress_ok: bool,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            period_ms: 60_000,
            in_progress_ok: false,
        }
    }
}

impl TailerConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(period) = std::env::var("QUORUMLOG_TAILER_PERIOD_MS") {
            if let Ok(ms) = period.parse() {
                self.period_ms = ms;
            }
        }
        if let Ok(in_progress) = std::env::var("QUORUMLOG_TAILER_IN_PROGRESS") {
            self.in_progress_ok = in_progress == "1" || in_progress.to_lowercase() == "true";
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("QUORUMLOG_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("QUORUMLOG_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde module for SocketAddr as a string.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.journal.target_count, 3);
        assert_eq!(config.journal.minimum_redundant_targets, 2);
        assert_eq!(config.metrics.bind_addr.port(), 9090);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_journal_dirs() {
        let mut journal = JournalConfig::default();
        assert_eq!(
            journal.journal_dirs(),
            vec![
                PathBuf::from("./data/journal-0"),
                PathBuf::from("./data/journal-1"),
                PathBuf::from("./data/journal-2"),
            ]
        );

        journal.dirs = vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")];
        assert_eq!(journal.journal_dirs().len(), 2);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.journal.minimum_redundant_targets = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.journal.minimum_redundant_targets = 0;
        assert!(config.validate().is_err());

        // A minority quorum only warns.
        config.journal.minimum_redundant_targets = 1;
        assert!(config.validate().is_ok());

        config.quorum.progress_info_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.journal.queued_edits_limit_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let mut config = Config::default();
        config.journal.rpc_timeout_ms = 1500;
        config.log.sync_buffer_size = 4096;
        config.log.sync_period_ms = 0;
        config.quorum.progress_interval_ms = 250;
        config.journal.queued_edits_limit_mb = 2;

        let set = config.journal_set_config();
        assert_eq!(set.minimum_redundant_targets, 2);
        assert_eq!(set.write_timeout, Duration::from_millis(1500));
        assert_eq!(set.policy.progress_interval, Duration::from_millis(250));
        assert_eq!(set.max_queued_bytes, 2 * 1024 * 1024);

        let log = config.edit_log_config();
        assert_eq!(log.sync_buffer_size, 4096);
        assert!(log.sync_period.is_zero());
    }

    #[test]
    fn test_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quorumlog.yaml");
        std::fs::write(
            &path,
            "journal:\n  target_count: 5\n  minimum_redundant_targets: 3\nmetrics:\n  enabled: true\n  bind_addr: \"127.0.0.1:9191\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.journal.target_count, 5);
        assert_eq!(config.journal.minimum_redundant_targets, 3);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.bind_addr.port(), 9191);
        assert_eq!(config.log.sync_period_ms, 5_000);

        let saved = dir.path().join("saved.yaml");
        config.save(&saved).unwrap();
        let parsed = Config::from_file(&saved).unwrap();
        assert_eq!(parsed.journal.target_count, 5);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/quorumlog.yaml"),
            Err(ConfigError::IoError(_, _))
        ));
    }
}
