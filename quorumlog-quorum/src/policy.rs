//! Waiting policy: pause detection and progress reporting thresholds.

use std::time::Duration;

/// Fraction of the timeout after which progress is reported at info level.
pub const DEFAULT_PROGRESS_INFO_FRACTION: f64 = 0.3;

/// Fraction of the timeout after which progress is reported at warn level.
pub const DEFAULT_PROGRESS_WARN_FRACTION: f64 = 0.7;

/// Fraction of the timeout an unexplained stall must exceed to count as a pause.
pub const DEFAULT_PAUSE_THRESHOLD_FRACTION: f64 = 0.3;

/// Interval between progress reports once reporting has started.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(1000);

/// Thresholds used by [`crate::QuorumCall::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuorumPolicy {
    /// A stall longer than this fraction of the total timeout is treated as
    /// the local process having been suspended.
    pub pause_threshold_fraction: f64,
    /// Start reporting progress after this fraction of the timeout.
    pub progress_info_fraction: f64,
    /// Escalate progress reports to warnings after this fraction.
    pub progress_warn_fraction: f64,
    /// Interval between consecutive progress reports.
    pub progress_interval: Duration,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            pause_threshold_fraction: DEFAULT_PAUSE_THRESHOLD_FRACTION,
            progress_info_fraction: DEFAULT_PROGRESS_INFO_FRACTION,
            progress_warn_fraction: DEFAULT_PROGRESS_WARN_FRACTION,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl QuorumPolicy {
    pub fn with_pause_threshold_fraction(mut self, fraction: f64) -> Self {
        self.pause_threshold_fraction = fraction;
        self
    }

    pub fn with_progress_fractions(mut self, info: f64, warn: f64) -> Self {
        self.progress_info_fraction = info;
        self.progress_warn_fraction = warn;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Delay before the first progress report.
    pub fn progress_info_after(&self, timeout: Duration) -> Duration {
        timeout.mul_f64(self.progress_info_fraction)
    }

    /// Waiting time after which progress reports become warnings.
    pub fn progress_warn_after(&self, timeout: Duration) -> Duration {
        timeout.mul_f64(self.progress_warn_fraction)
    }

    /// Stall length beyond which a pause is assumed.
    pub fn pause_threshold(&self, timeout: Duration) -> Duration {
        timeout.mul_f64(self.pause_threshold_fraction)
    }

    /// Returns how far a deadline should move after a suspected pause.
    ///
    /// `elapsed` is what the stopwatch measured, `expected` how long the
    /// caller asked to sleep. The excess counts as a pause only when it is
    /// larger than the threshold for `timeout`.
    pub fn pause_extension(
        &self,
        elapsed: Duration,
        expected: Duration,
        timeout: Duration,
    ) -> Option<Duration> {
        let excess = elapsed.saturating_sub(expected);
        if excess > self.pause_threshold(timeout) {
            Some(excess)
        } else {
            None
        }
    }

    /// Validates that every fraction lies in `(0, 1]`.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("pause_threshold_fraction", self.pause_threshold_fraction),
            ("progress_info_fraction", self.progress_info_fraction),
            ("progress_warn_fraction", self.progress_warn_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(format!("{} must be in (0, 1], got {}", name, value));
            }
        }
        if self.progress_warn_fraction < self.progress_info_fraction {
            return Err("progress_warn_fraction must not be below progress_info_fraction".into());
        }
        Ok(())
    }
}
