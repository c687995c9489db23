//! Writer role control driven by a liveness monitor.
//!
//! The monitor reports state changes through [`RoleController::on_state_change`].
//! Notifications are queued and handled one at a time on a dedicated thread,
//! in the order they were reported.

use parking_lot::{Condvar, Mutex};
use quorumlog_core::EditLog;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Health of the monitored service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceHealth {
    Initializing,
    Healthy,
    Unhealthy,
    Failed,
}

impl fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceHealth::Initializing => "INITIALIZING",
            ServiceHealth::Healthy => "HEALTHY",
            ServiceHealth::Unhealthy => "UNHEALTHY",
            ServiceHealth::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Role of this node's edit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writer,
    Reader,
    /// Revocation could not bring the log into read mode.
    Failed,
}

struct Shared {
    log: Arc<EditLog>,
    role: Mutex<Role>,
    handled: Mutex<u64>,
    handled_cond: Condvar,
}

/// Consumes liveness notifications and revokes the writer role when the
/// service stops being healthy.
pub struct RoleController {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<ServiceHealth>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RoleController {
    /// Starts the dispatch thread. `role` is the current role of `log`.
    pub fn start(log: Arc<EditLog>, role: Role) -> Self {
        let shared = Arc::new(Shared {
            log,
            role: Mutex::new(role),
            handled: Mutex::new(0),
            handled_cond: Condvar::new(),
        });
        let (sender, receiver) = mpsc::channel();

        let worker = Arc::clone(&shared);
        let dispatcher = std::thread::Builder::new()
            .name("role-controller".to_string())
            .spawn(move || dispatch(worker, receiver));
        let dispatcher = match dispatcher {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!("Failed to start role controller thread: {}", e);
                None
            }
        };

        Self {
            shared,
            sender: Mutex::new(dispatcher.as_ref().map(|_| sender)),
            dispatcher: Mutex::new(dispatcher),
        }
    }

    /// Liveness callback. Returns immediately; the change is handled on the
    /// dispatch thread.
    pub fn on_state_change(&self, state: ServiceHealth) {
        match self.sender.lock().as_ref() {
            Some(sender) => {
                if sender.send(state).is_err() {
                    tracing::warn!("Role controller stopped; dropping state change to {}", state);
                }
            }
            None => tracing::warn!("Role controller stopped; dropping state change to {}", state),
        }
    }

    pub fn role(&self) -> Role {
        *self.shared.role.lock()
    }

    /// Number of notifications handled so far.
    pub fn handled(&self) -> u64 {
        *self.shared.handled.lock()
    }

    /// Blocks until at least `count` notifications were handled or `timeout`
    /// passes. Returns whether the count was reached.
    pub fn wait_handled(&self, count: u64, timeout: Duration) -> bool {
        let mut handled = self.shared.handled.lock();
        let deadline = std::time::Instant::now() + timeout;
        while *handled < count {
            if self
                .shared
                .handled_cond
                .wait_until(&mut handled, deadline)
                .timed_out()
            {
                return *handled >= count;
            }
        }
        true
    }

    /// Stops accepting notifications and waits for queued ones to finish.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Role controller thread panicked");
            }
        }
    }
}

impl Drop for RoleController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(shared: Arc<Shared>, receiver: Receiver<ServiceHealth>) {
    while let Ok(state) = receiver.recv() {
        handle(&shared, state);
        let mut handled = shared.handled.lock();
        *handled += 1;
        shared.handled_cond.notify_all();
    }
    tracing::debug!("Role controller stopped");
}

fn handle(shared: &Shared, state: ServiceHealth) {
    let role = *shared.role.lock();
    tracing::info!("Service state changed to {} while {:?}", state, role);
    if state == ServiceHealth::Healthy || role != Role::Writer {
        return;
    }

    tracing::warn!("Revoking writer role after service became {}", state);
    shared.log.wait_for_sync_to_finish();
    if let Err(e) = shared.log.close() {
        tracing::error!("Failed to close edit log while revoking writer role: {}", e);
    }
    let next = match shared.log.init_for_read() {
        Ok(()) => Role::Reader,
        Err(e) => {
            tracing::error!("Failed to reopen edit log for reading: {}", e);
            Role::Failed
        }
    };
    *shared.role.lock() = next;
    tracing::info!("Edit log role is now {:?}", next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumlog_core::{EditLogConfig, LogState, RecordingFatalHandler};
    use quorumlog_journal::{
        Fault, JournalSet, JournalSetConfig, JournalTarget, LogSegment, MemoryJournal,
    };

    fn writer(journals: &[Arc<MemoryJournal>], fatal: Arc<RecordingFatalHandler>) -> Arc<EditLog> {
        let targets: Vec<Arc<dyn JournalTarget>> = journals
            .iter()
            .map(|j| Arc::clone(j) as Arc<dyn JournalTarget>)
            .collect();
        let config = JournalSetConfig::new(2)
            .with_write_timeout(Duration::from_millis(500))
            .with_segment_timeout(Duration::from_millis(500));
        let set = Arc::new(JournalSet::new(targets, config).unwrap());
        let log = EditLog::new(set, EditLogConfig::default()).with_fatal_handler(fatal);
        log.init_for_write().unwrap();
        log.open_for_write().unwrap();
        Arc::new(log)
    }

    fn journals() -> Vec<Arc<MemoryJournal>> {
        (0..3)
            .map(|i| Arc::new(MemoryJournal::new(format!("m{}", i))))
            .collect()
    }

    #[test]
    fn test_unhealthy_revokes_writer() {
        let journals = journals();
        let log = writer(&journals, Arc::new(RecordingFatalHandler::new()));
        log.append_transaction("pending").unwrap();

        let controller = RoleController::start(Arc::clone(&log), Role::Writer);
        controller.on_state_change(ServiceHealth::Healthy);
        controller.on_state_change(ServiceHealth::Unhealthy);
        controller.on_state_change(ServiceHealth::Failed);
        assert!(controller.wait_handled(3, Duration::from_secs(5)));

        assert_eq!(controller.role(), Role::Reader);
        assert_eq!(log.state(), LogState::OpenForReading);
        assert_eq!(
            log.select_segments(0, false).unwrap(),
            vec![LogSegment::finalized(1, 3)]
        );
    }

    #[test]
    fn test_healthy_keeps_writer() {
        let journals = journals();
        let log = writer(&journals, Arc::new(RecordingFatalHandler::new()));

        let controller = RoleController::start(Arc::clone(&log), Role::Writer);
        controller.on_state_change(ServiceHealth::Healthy);
        controller.on_state_change(ServiceHealth::Healthy);
        assert!(!controller.wait_handled(3, Duration::from_millis(50)));
        assert_eq!(controller.handled(), 2);
        assert_eq!(controller.role(), Role::Writer);
        assert_eq!(log.state(), LogState::InSegment);

        // Initializing is not healthy either.
        controller.on_state_change(ServiceHealth::Initializing);
        assert!(controller.wait_handled(3, Duration::from_secs(5)));
        assert_eq!(controller.role(), Role::Reader);
    }

    #[test]
    fn test_poisoned_log_revocation_fails() {
        let journals = journals();
        let fatal = Arc::new(RecordingFatalHandler::new());
        let log = writer(&journals, fatal.clone());
        journals[1].inject(Fault::Fail("gone".into()));
        journals[2].inject(Fault::Fail("gone".into()));
        let txid = log.append_transaction("x").unwrap().txid;
        assert!(log.sync(txid).is_err());

        let controller = RoleController::start(Arc::clone(&log), Role::Writer);
        controller.on_state_change(ServiceHealth::Unhealthy);
        assert!(controller.wait_handled(1, Duration::from_secs(5)));
        assert_eq!(controller.role(), Role::Failed);
        assert_eq!(fatal.count(), 1);
    }

    #[test]
    fn test_shutdown_drops_later_notifications() {
        let journals = journals();
        let log = writer(&journals, Arc::new(RecordingFatalHandler::new()));
        let controller = RoleController::start(Arc::clone(&log), Role::Writer);
        controller.shutdown();

        controller.on_state_change(ServiceHealth::Failed);
        assert_eq!(controller.handled(), 0);
        assert_eq!(controller.role(), Role::Writer);
    }
}
