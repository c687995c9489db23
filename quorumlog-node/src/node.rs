//! Assembly of a quorumlog node from its configuration.

use crate::config::Config;
use crate::error::NodeError;
use crate::image::DirImageStore;
use crate::liveness::{Role, RoleController};
use crate::metrics::Metrics;
use crate::tailer::LogTailer;
use quorumlog_core::{EditLog, ExitProcess, FatalHandler};
use quorumlog_journal::{FileJournal, JournalSet, JournalTarget};
use std::sync::Arc;

/// A node: file-backed journal targets, the journal set over them, the edit
/// log, and the optional image store.
pub struct Node {
    config: Config,
    journals: Arc<JournalSet>,
    log: Arc<EditLog>,
    metrics: Arc<Metrics>,
    images: Option<Arc<DirImageStore>>,
}

impl Node {
    /// Opens the journal directories named by `config`, formatting any that
    /// are new. Durability loss terminates the process.
    pub fn open(config: Config) -> Result<Self, NodeError> {
        Self::open_with(config, Arc::new(ExitProcess))
    }

    /// Like [`Node::open`] with a custom fatal failure handler.
    pub fn open_with(config: Config, fatal: Arc<dyn FatalHandler>) -> Result<Self, NodeError> {
        config.validate()?;

        let mut targets: Vec<Arc<dyn JournalTarget>> = Vec::new();
        for (i, dir) in config.journal.journal_dirs().into_iter().enumerate() {
            let journal = FileJournal::open(format!("journal-{}", i), &dir)?;
            if journal.storage_info()?.is_none() {
                journal.format()?;
                tracing::info!("Formatted journal directory {}", dir.display());
            }
            tracing::info!("  Journal {}: {}", i, dir.display());
            targets.push(Arc::new(journal));
        }

        let journals = Arc::new(JournalSet::new(targets, config.journal_set_config())?);
        let log = Arc::new(
            EditLog::new(Arc::clone(&journals), config.edit_log_config()).with_fatal_handler(fatal),
        );
        let images = match &config.image.dir {
            Some(dir) => Some(Arc::new(DirImageStore::open(dir)?)),
            None => None,
        };

        Ok(Self {
            config,
            journals,
            log,
            metrics: Arc::new(Metrics::new()?),
            images,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log(&self) -> &Arc<EditLog> {
        &self.log
    }

    pub fn journals(&self) -> &Arc<JournalSet> {
        &self.journals
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn images(&self) -> Option<&Arc<DirImageStore>> {
        self.images.as_ref()
    }

    /// Takes the writer role: recovers unclosed segments and opens a new
    /// one. Returns the first txid of the new segment.
    pub fn start_writer(&self) -> Result<u64, NodeError> {
        self.log.init_for_write()?;
        let last = self.log.recover_unclosed_segments()?;
        let segment = self.log.open_for_write()?;
        tracing::info!(
            "Writer started: last recovered txid {}, new segment at {}",
            last,
            segment
        );
        Ok(segment)
    }

    /// Opens the log for reading and returns a tailer positioned after
    /// `last_applied`.
    pub fn start_reader(&self, last_applied: u64) -> Result<LogTailer, NodeError> {
        self.log.init_for_read()?;
        Ok(
            LogTailer::new(Arc::clone(&self.log), last_applied, self.config.tailer.period())
                .with_in_progress(self.config.tailer.in_progress_ok),
        )
    }

    /// Starts a role controller for the current role of the log.
    pub fn role_controller(&self) -> RoleController {
        let role = if self.log.is_open_for_write() {
            Role::Writer
        } else {
            Role::Reader
        };
        RoleController::start(Arc::clone(&self.log), role)
    }

    /// Copies log statistics into the metrics registry.
    pub fn observe_metrics(&self) {
        self.metrics.observe(&self.log);
    }

    /// Closes the edit log, then the journal set.
    pub fn shutdown(&self) -> Result<(), NodeError> {
        let result = self.log.close();
        self.journals.close()?;
        tracing::info!("Node stopped at txid {}", self.log.last_written_txid());
        result.map_err(NodeError::from)
    }
}
