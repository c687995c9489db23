//! Quorum call: a fixed set of keyed operations awaiting responses.
//!
//! Each key settles at most once, into either the success map or the
//! failure map. Callers block in [`QuorumCall::wait_for`] until a
//! threshold over those maps holds or the deadline passes.

use crate::clock::{Clock, MonotonicClock, Stopwatch};
use crate::error::QuorumError;
use crate::policy::QuorumPolicy;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Shortest sleep between two evaluations of the wait predicate.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Failure type accepted by a quorum call.
///
/// Defects are programming errors detected by a replica. They are raised
/// from `wait_for` even when a quorum of successes has already arrived.
pub trait CallError: std::error::Error + Send + Sync + 'static {
    fn is_defect(&self) -> bool {
        false
    }
}

struct Outcomes<K, R, E> {
    expected: HashSet<K>,
    successes: HashMap<K, R>,
    failures: HashMap<K, E>,
}

impl<K, R, E> Outcomes<K, R, E>
where
    K: Eq + Hash + Display,
    E: CallError,
{
    fn responses(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    fn is_settled(&self, key: &K) -> bool {
        self.successes.contains_key(key) || self.failures.contains_key(key)
    }

    fn success_keys(&self) -> String {
        self.successes
            .keys()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|(k, e)| format!("{}: {}", k, e))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn first_defect(&self) -> Option<(&K, &E)> {
        self.failures.iter().find(|(_, e)| e.is_defect())
    }
}

struct Shared<K, R, E> {
    outcomes: Mutex<Outcomes<K, R, E>>,
    settled: Condvar,
}

impl<K, R, E> Shared<K, R, E>
where
    K: Clone + Eq + Hash + Display,
    E: CallError,
{
    fn settle(&self, key: &K, result: Result<R, E>) {
        let mut outcomes = self.outcomes.lock();
        if outcomes.is_settled(key) {
            let kind = if result.is_ok() { "success" } else { "failure" };
            tracing::warn!("Ignoring duplicate {} response from {}", kind, key);
            return;
        }
        match result {
            Ok(value) => {
                outcomes.successes.insert(key.clone(), value);
            }
            Err(error) => {
                outcomes.failures.insert(key.clone(), error);
            }
        }
        self.settled.notify_all();
    }
}

/// Handle used to deliver the response for one key.
pub struct Settler<K, R, E> {
    key: K,
    shared: Arc<Shared<K, R, E>>,
}

impl<K: Clone, R, E> Clone for Settler<K, R, E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<K, R, E> Settler<K, R, E>
where
    K: Clone + Eq + Hash + Display,
    E: CallError,
{
    /// Returns the key this settler answers for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Records the outcome. Only the first outcome per key is kept.
    pub fn settle(&self, result: Result<R, E>) {
        self.shared.settle(&self.key, result);
    }

    pub fn success(&self, value: R) {
        self.settle(Ok(value));
    }

    pub fn failure(&self, error: E) {
        self.settle(Err(error));
    }
}

/// A set of outgoing calls for which a quorum of results is needed.
pub struct QuorumCall<K, R, E> {
    shared: Arc<Shared<K, R, E>>,
    policy: QuorumPolicy,
    clock: Arc<dyn Clock>,
}

impl<K, R, E> QuorumCall<K, R, E>
where
    K: Clone + Eq + Hash + Display + Debug + Send + 'static,
    R: Clone + Debug + Send + 'static,
    E: CallError,
{
    /// Creates a call over the given keys using the process monotonic clock.
    pub fn new(keys: impl IntoIterator<Item = K>, policy: QuorumPolicy) -> Self {
        Self::with_clock(keys, policy, Arc::new(MonotonicClock))
    }

    /// Creates a call over the given keys with an explicit clock.
    pub fn with_clock(
        keys: impl IntoIterator<Item = K>,
        policy: QuorumPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let outcomes = Outcomes {
            expected: keys.into_iter().collect(),
            successes: HashMap::new(),
            failures: HashMap::new(),
        };
        Self {
            shared: Arc::new(Shared {
                outcomes: Mutex::new(outcomes),
                settled: Condvar::new(),
            }),
            policy,
            clock,
        }
    }

    /// Returns the settler for a registered key.
    pub fn settler(&self, key: &K) -> Option<Settler<K, R, E>> {
        let outcomes = self.shared.outcomes.lock();
        outcomes.expected.get(key).map(|k| Settler {
            key: k.clone(),
            shared: self.shared.clone(),
        })
    }

    /// Returns settlers for every registered key.
    pub fn settlers(&self) -> Vec<Settler<K, R, E>> {
        let outcomes = self.shared.outcomes.lock();
        outcomes
            .expected
            .iter()
            .map(|k| Settler {
                key: k.clone(),
                shared: self.shared.clone(),
            })
            .collect()
    }

    /// Number of keys registered at construction.
    pub fn count_expected(&self) -> usize {
        self.shared.outcomes.lock().expected.len()
    }

    /// Number of keys that have answered, successfully or not.
    pub fn count_responses(&self) -> usize {
        self.shared.outcomes.lock().responses()
    }

    pub fn count_successes(&self) -> usize {
        self.shared.outcomes.lock().successes.len()
    }

    pub fn count_exceptions(&self) -> usize {
        self.shared.outcomes.lock().failures.len()
    }

    /// Returns a copy of the successes received so far.
    ///
    /// The copy is not affected by responses that arrive later.
    pub fn snapshot_successes(&self) -> HashMap<K, R> {
        self.shared.outcomes.lock().successes.clone()
    }

    /// Returns the keys whose calls failed so far.
    pub fn failed_keys(&self) -> Vec<K> {
        self.shared.outcomes.lock().failures.keys().cloned().collect()
    }

    /// Builds one error describing every key's outcome.
    ///
    /// Returns `None` while no failure has been recorded.
    pub fn aggregate_failure(&self, message: impl Into<String>) -> Option<QuorumError> {
        let outcomes = self.shared.outcomes.lock();
        if outcomes.failures.is_empty() {
            return None;
        }
        let mut successes: Vec<(String, String)> = outcomes
            .successes
            .iter()
            .map(|(k, r)| (k.to_string(), format!("{:?}", r)))
            .collect();
        let mut failures: Vec<(String, String)> = outcomes
            .failures
            .iter()
            .map(|(k, e)| (k.to_string(), e.to_string()))
            .collect();
        successes.sort();
        failures.sort();
        Some(QuorumError::Failed {
            message: message.into(),
            successes,
            failures,
        })
    }

    /// Blocks until one of the return conditions holds.
    ///
    /// Returns when at least `min_responses` keys answered (0 disables), when
    /// at least `min_successes` succeeded (0 disables), or when more than
    /// `max_exceptions` failed. Returning does not imply success; inspect the
    /// counts afterwards.
    ///
    /// If the stopwatch shows a sleep that overran by more than the policy's
    /// pause threshold, the overrun is added to the deadline instead of being
    /// charged to the remote side.
    pub fn wait_for(
        &self,
        min_responses: usize,
        min_successes: usize,
        max_exceptions: usize,
        timeout: Duration,
        operation: &str,
    ) -> Result<(), QuorumError> {
        let clock = self.clock.as_ref();
        let started = clock.now();
        let mut next_report = started + self.policy.progress_info_after(timeout);
        let mut deadline = started + timeout;
        let mut stopwatch = Stopwatch::start(clock);

        let mut outcomes = self.shared.outcomes.lock();
        loop {
            if let Some((key, error)) = outcomes.first_defect() {
                return Err(QuorumError::Defect {
                    operation: operation.to_string(),
                    key: key.to_string(),
                    message: error.to_string(),
                });
            }

            if min_responses > 0 && outcomes.responses() >= min_responses {
                return Ok(());
            }
            if min_successes > 0 && outcomes.successes.len() >= min_successes {
                return Ok(());
            }
            if outcomes.failures.len() > max_exceptions {
                return Ok(());
            }

            let now = clock.now();
            if now > next_report {
                self.report_progress(&outcomes, now - started, timeout, operation);
                next_report = now + self.policy.progress_interval;
            }

            // The stopwatch runs since the last wakeup, so a stall before this
            // check is credited too.
            if now >= deadline {
                match self
                    .policy
                    .pause_extension(stopwatch.elapsed(), Duration::ZERO, timeout)
                {
                    Some(pause) => {
                        tracing::info!(
                            "Pause detected while waiting for {}; extending deadline by {} ms",
                            operation,
                            pause.as_millis()
                        );
                        deadline += pause;
                    }
                    None => {
                        return Err(QuorumError::Timeout {
                            operation: operation.to_string(),
                            waited_ms: (now - started).as_millis() as u64,
                            succeeded: outcomes.success_keys(),
                            failed: outcomes.failure_summary(),
                        });
                    }
                }
            }

            let sleep = deadline
                .saturating_duration_since(now)
                .min(next_report.saturating_duration_since(now))
                .max(MIN_WAIT);

            stopwatch.restart();
            self.shared.settled.wait_for(&mut outcomes, sleep);

            if let Some(pause) = self
                .policy
                .pause_extension(stopwatch.elapsed(), sleep, timeout)
            {
                tracing::info!(
                    "Pause detected while waiting for {}; extending deadline by {} ms",
                    operation,
                    pause.as_millis()
                );
                deadline += pause;
            }
            stopwatch.restart();
        }
    }

    fn report_progress(
        &self,
        outcomes: &Outcomes<K, R, E>,
        waited: Duration,
        timeout: Duration,
        operation: &str,
    ) {
        let mut msg = format!(
            "Waited {} ms (timeout={} ms) for a response for {}",
            waited.as_millis(),
            timeout.as_millis(),
            operation
        );
        if !outcomes.successes.is_empty() {
            msg.push_str(&format!(". Succeeded so far: [{}]", outcomes.success_keys()));
        }
        if !outcomes.failures.is_empty() {
            msg.push_str(&format!(". Exceptions so far: [{}]", outcomes.failure_summary()));
        }
        if outcomes.successes.is_empty() && outcomes.failures.is_empty() {
            msg.push_str(". No responses yet.");
        }

        if waited > self.policy.progress_warn_after(timeout) {
            tracing::warn!("{}", msg);
        } else {
            tracing::info!("{}", msg);
        }
    }
}
