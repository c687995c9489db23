//! Directory-backed journal target.
//!
//! Layout of a journal directory:
//!
//! ```text
//! <dir>/VERSION                                 storage id and layout version (JSON)
//! <dir>/0000000000000001-0000000000000064.log   finalized segment [1, 100]
//! <dir>/0000000000000065.inprogress             open segment starting at 101
//! <dir>/00000000000000c8.aborted                abandoned segment
//! ```

use crate::error::JournalError;
use crate::record::{Transaction, TxBatch, TxRecord};
use crate::recovery::scan_segment_file;
use crate::segment::{
    aborted_filename, finalized_filename, in_progress_filename, list_segments, sync_parent,
    LogSegment, SegmentFile, SegmentStatus,
};
use crate::target::{check_continuity, JournalTarget, WriteAck};
use crate::{LAYOUT_VERSION, RECORD_HEADER_SIZE};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

const VERSION_FILE: &str = "VERSION";

/// Contents of the VERSION file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub storage_id: Uuid,
    pub layout_version: u32,
    pub formatted_at: DateTime<Utc>,
}

/// I/O statistics for a file journal.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileJournalStats {
    pub bytes_written: u64,
    pub writes: u64,
    pub fsyncs: u64,
}

struct OpenSegment {
    start_txid: u64,
    last_written: u64,
    file: SegmentFile,
}

/// A journal target storing segments as files in one directory.
pub struct FileJournal {
    id: String,
    dir: PathBuf,
    open: Mutex<Option<OpenSegment>>,
    stats_bytes_written: AtomicU64,
    stats_writes: AtomicU64,
    stats_fsyncs: AtomicU64,
}

impl FileJournal {
    /// Opens the journal at `dir`, creating the directory if needed.
    ///
    /// The directory is not formatted; see [`JournalTarget::format`].
    pub fn open(id: impl Into<String>, dir: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            id: id.into(),
            dir,
            open: Mutex::new(None),
            stats_bytes_written: AtomicU64::new(0),
            stats_writes: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads the VERSION file, if the directory is formatted.
    pub fn storage_info(&self) -> Result<Option<StorageInfo>, JournalError> {
        read_storage_info(&self.dir)
    }

    pub fn stats(&self) -> FileJournalStats {
        FileJournalStats {
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            writes: self.stats_writes.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
        }
    }

    fn check_formatted(&self) -> Result<(), JournalError> {
        match read_storage_info(&self.dir)? {
            Some(info) if info.layout_version == LAYOUT_VERSION => Ok(()),
            Some(info) => Err(JournalError::InvalidState(format!(
                "{}: unsupported layout version {} (expected {})",
                self.id, info.layout_version, LAYOUT_VERSION
            ))),
            None => Err(JournalError::Unformatted(self.id.clone())),
        }
    }

    fn path(&self, name: String) -> PathBuf {
        self.dir.join(name)
    }

    /// Closes an open segment that the set has moved past.
    fn close_lagging(&self, open: OpenSegment, next_start: u64) -> Result<(), JournalError> {
        tracing::warn!(
            "{}: closing lagging segment {} at txid {} before starting {}",
            self.id,
            open.start_txid,
            open.last_written,
            next_start
        );
        if open.last_written < open.start_txid {
            open.file
                .rename(self.path(aborted_filename(open.start_txid)))?;
        } else {
            open.file.rename(
                self.path(finalized_filename(open.start_txid, open.last_written)),
            )?;
        }
        Ok(())
    }

    fn segment_path(&self, start_txid: u64) -> Result<Option<(LogSegment, PathBuf)>, JournalError> {
        Ok(list_segments(&self.dir)?
            .into_iter()
            .find(|(s, _)| s.start_txid == start_txid && s.status != SegmentStatus::Aborted))
    }
}

impl JournalTarget for FileJournal {
    fn id(&self) -> &str {
        &self.id
    }

    fn format(&self) -> Result<(), JournalError> {
        if !list_segments(&self.dir)?.is_empty() {
            return Err(JournalError::InvalidState(format!(
                "{}: refusing to format a directory that holds segments",
                self.id
            )));
        }

        let info = StorageInfo {
            storage_id: Uuid::new_v4(),
            layout_version: LAYOUT_VERSION,
            formatted_at: Utc::now(),
        };
        let tmp = self.dir.join(format!("{}.tmp", VERSION_FILE));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&info)?)?;
        let path = self.dir.join(VERSION_FILE);
        std::fs::rename(&tmp, &path)?;
        sync_parent(&path)?;

        tracing::info!("{}: formatted with storage id {}", self.id, info.storage_id);
        Ok(())
    }

    fn start_segment(&self, start_txid: u64) -> Result<(), JournalError> {
        self.check_formatted()?;
        let mut open = self.open.lock();

        if let Some(lagging) = open.take() {
            self.close_lagging(lagging, start_txid)?;
        }

        for (segment, _) in list_segments(&self.dir)? {
            let overlaps = match segment.status {
                SegmentStatus::Finalized => segment.end_txid >= start_txid,
                SegmentStatus::InProgress => segment.start_txid >= start_txid,
                SegmentStatus::Aborted => false,
            };
            if overlaps {
                return Err(JournalError::InvalidState(format!(
                    "{}: segment starting at {} overlaps existing segment {}",
                    self.id, start_txid, segment
                )));
            }
        }

        let file = SegmentFile::create(self.path(in_progress_filename(start_txid)))?;
        sync_parent(file.path())?;
        *open = Some(OpenSegment {
            start_txid,
            last_written: start_txid.saturating_sub(1),
            file,
        });

        tracing::debug!("{}: started segment {}", self.id, start_txid);
        Ok(())
    }

    fn write(&self, segment_start: u64, batch: &TxBatch) -> Result<WriteAck, JournalError> {
        let mut guard = self.open.lock();
        let (open_start, last_written) = match guard.as_ref() {
            Some(open) => (Some(open.start_txid), open.last_written),
            None => (None, 0),
        };
        check_continuity(&self.id, open_start, last_written, segment_start, batch)?;

        let open = guard
            .as_mut()
            .ok_or_else(|| JournalError::Defect(format!("{}: no open segment", self.id)))?;
        open.file.append(&batch.data)?;
        open.file.sync()?;
        open.last_written = batch.last_txid();

        self.stats_bytes_written
            .fetch_add(batch.data.len() as u64, Ordering::Relaxed);
        self.stats_writes.fetch_add(1, Ordering::Relaxed);
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);

        Ok(WriteAck {
            first_txid: batch.first_txid,
            last_txid: batch.last_txid(),
            bytes: batch.data.len() as u64,
        })
    }

    fn finalize_segment(&self, start_txid: u64, end_txid: u64) -> Result<(), JournalError> {
        let mut guard = self.open.lock();

        if guard.as_ref().map(|o| o.start_txid) == Some(start_txid) {
            let last = guard.as_ref().map(|o| o.last_written).unwrap_or_default();
            if last != end_txid {
                return Err(JournalError::OutOfSync {
                    target: self.id.clone(),
                    reason: format!(
                        "cannot finalize segment {} at {}: last written is {}",
                        start_txid, end_txid, last
                    ),
                });
            }
            if let Some(open) = guard.take() {
                open.file
                    .rename(self.path(finalized_filename(start_txid, end_txid)))?;
            }
            tracing::debug!("{}: finalized segment [{}, {}]", self.id, start_txid, end_txid);
            return Ok(());
        }
        drop(guard);

        match self.segment_path(start_txid)? {
            Some((segment, _)) if segment.is_finalized() && segment.end_txid == end_txid => Ok(()),
            Some((segment, path)) if segment.is_in_progress() => {
                let scan = scan_segment_file(&path, start_txid, false)?;
                if scan.last_txid != Some(end_txid) {
                    return Err(JournalError::OutOfSync {
                        target: self.id.clone(),
                        reason: format!(
                            "cannot finalize segment {} at {}: file ends at {:?}",
                            start_txid, end_txid, scan.last_txid
                        ),
                    });
                }
                SegmentFile::open(&path)?.rename(self.path(finalized_filename(start_txid, end_txid)))?;
                Ok(())
            }
            Some((segment, _)) => Err(JournalError::InvalidState(format!(
                "{}: cannot finalize {} at {}",
                self.id, segment, end_txid
            ))),
            None => Err(JournalError::SegmentNotFound(start_txid)),
        }
    }

    fn abort_segment(&self, start_txid: u64) -> Result<(), JournalError> {
        let mut guard = self.open.lock();
        if guard.as_ref().map(|o| o.start_txid) == Some(start_txid) {
            if let Some(open) = guard.take() {
                open.file.rename(self.path(aborted_filename(start_txid)))?;
            }
            tracing::info!("{}: aborted segment {}", self.id, start_txid);
            return Ok(());
        }
        drop(guard);

        match self.segment_path(start_txid)? {
            Some((segment, path)) if segment.is_in_progress() => {
                SegmentFile::open(&path)?.rename(self.path(aborted_filename(start_txid)))?;
                Ok(())
            }
            Some((segment, _)) => Err(JournalError::InvalidState(format!(
                "{}: cannot abort {}",
                self.id, segment
            ))),
            None if self.path(aborted_filename(start_txid)).exists() => Ok(()),
            None => Err(JournalError::SegmentNotFound(start_txid)),
        }
    }

    fn recover_unfinalized(&self) -> Result<Vec<LogSegment>, JournalError> {
        self.check_formatted()?;
        let mut guard = self.open.lock();
        if let Some(open) = guard.take() {
            let mut file = open.file;
            file.sync()?;
        }

        let mut recovered = Vec::new();
        for (segment, path) in list_segments(&self.dir)? {
            if !segment.is_in_progress() {
                continue;
            }
            let scan = scan_segment_file(&path, segment.start_txid, true)?;
            let file = SegmentFile::open(&path)?;
            let result = match scan.last_txid {
                Some(last) => {
                    file.rename(self.path(finalized_filename(segment.start_txid, last)))?;
                    LogSegment::finalized(segment.start_txid, last)
                }
                None => {
                    file.rename(self.path(aborted_filename(segment.start_txid)))?;
                    LogSegment::aborted(segment.start_txid)
                }
            };
            tracing::info!(
                "{}: recovered in-progress segment {} as {}",
                self.id,
                segment.start_txid,
                result
            );
            recovered.push(result);
        }
        Ok(recovered)
    }

    fn segments(
        &self,
        from_txid: u64,
        in_progress_ok: bool,
    ) -> Result<Vec<LogSegment>, JournalError> {
        self.check_formatted()?;
        let open = self
            .open
            .lock()
            .as_ref()
            .map(|o| (o.start_txid, o.last_written));

        let mut result = Vec::new();
        for (segment, path) in list_segments(&self.dir)? {
            let segment = match segment.status {
                SegmentStatus::Finalized => segment,
                SegmentStatus::InProgress if in_progress_ok => {
                    let end = match open {
                        Some((start, last)) if start == segment.start_txid => last,
                        _ => match scan_segment_file(&path, segment.start_txid, false)?.last_txid {
                            Some(last) => last,
                            None => continue,
                        },
                    };
                    LogSegment::in_progress(segment.start_txid, end)
                }
                _ => continue,
            };
            if !segment.is_empty() && segment.end_txid >= from_txid {
                result.push(segment);
            }
        }
        Ok(result)
    }

    fn read_segment(&self, start_txid: u64) -> Result<Vec<Transaction>, JournalError> {
        let (segment, path) = self
            .segment_path(start_txid)?
            .ok_or(JournalError::SegmentNotFound(start_txid))?;

        let mut data = std::fs::read(&path)?;
        if segment.is_in_progress() {
            let scan = scan_segment_file(&path, start_txid, false)?;
            data.truncate(scan.valid_len as usize);
        }
        decode_all(&data)
    }

    fn purge_before(&self, min_txid: u64) -> Result<usize, JournalError> {
        let mut purged = 0;
        for (segment, path) in list_segments(&self.dir)? {
            let purge = match segment.status {
                SegmentStatus::Finalized => segment.end_txid < min_txid,
                SegmentStatus::Aborted => segment.start_txid < min_txid,
                SegmentStatus::InProgress => false,
            };
            if purge {
                std::fs::remove_file(&path)?;
                tracing::debug!("{}: purged segment {}", self.id, segment);
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn close(&self) -> Result<(), JournalError> {
        if let Some(open) = self.open.lock().as_mut() {
            open.file.sync()?;
        }
        Ok(())
    }
}

/// Reads the VERSION file from a journal directory.
pub fn read_storage_info(dir: &Path) -> Result<Option<StorageInfo>, JournalError> {
    let path = dir.join(VERSION_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    Ok(Some(serde_json::from_slice(&data)?))
}

fn decode_all(data: &[u8]) -> Result<Vec<Transaction>, JournalError> {
    let mut buf = BytesMut::from(data);
    let mut txns = Vec::new();
    let mut offset = 0u64;
    while buf.len() >= RECORD_HEADER_SIZE {
        match TxRecord::decode(&mut buf, offset)? {
            Some(record) => {
                offset += record.disk_size() as u64;
                txns.push(record.into_transaction());
            }
            None => break,
        }
    }
    Ok(txns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TxKind;
    use tempfile::TempDir;

    fn batch(first: u64, count: u64) -> TxBatch {
        let txns: Vec<Transaction> = (first..first + count)
            .map(|txid| Transaction::new(txid, TxKind::Op, format!("op-{}", txid)))
            .collect();
        TxBatch::from_transactions(&txns).unwrap()
    }

    fn formatted(dir: &TempDir) -> FileJournal {
        let journal = FileJournal::open("j1", dir.path()).unwrap();
        journal.format().unwrap();
        journal
    }

    #[test]
    fn test_format_writes_version() {
        let dir = TempDir::new().unwrap();
        let journal = FileJournal::open("j1", dir.path()).unwrap();
        assert!(journal.storage_info().unwrap().is_none());
        assert!(matches!(
            journal.start_segment(1),
            Err(JournalError::Unformatted(_))
        ));

        journal.format().unwrap();
        let info = journal.storage_info().unwrap().unwrap();
        assert_eq!(info.layout_version, LAYOUT_VERSION);
    }

    #[test]
    fn test_write_finalize_read() {
        let dir = TempDir::new().unwrap();
        let journal = formatted(&dir);

        journal.start_segment(1).unwrap();
        journal.write(1, &batch(1, 3)).unwrap();
        journal.write(1, &batch(4, 2)).unwrap();
        journal.finalize_segment(1, 5).unwrap();

        assert!(dir.path().join(finalized_filename(1, 5)).exists());
        assert_eq!(journal.segments(0, false).unwrap(), vec![LogSegment::finalized(1, 5)]);

        let txns = journal.read_segment(1).unwrap();
        assert_eq!(txns.len(), 5);
        assert_eq!(txns[4].txid, 5);

        let stats = journal.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.fsyncs, 2);

        // Repeating the finalize is a no-op.
        journal.finalize_segment(1, 5).unwrap();
    }

    #[test]
    fn test_finalize_wrong_end_is_out_of_sync() {
        let dir = TempDir::new().unwrap();
        let journal = formatted(&dir);
        journal.start_segment(1).unwrap();
        journal.write(1, &batch(1, 3)).unwrap();

        assert!(matches!(
            journal.finalize_segment(1, 4),
            Err(JournalError::OutOfSync { .. })
        ));
    }

    #[test]
    fn test_start_overlapping_finalized_rejected() {
        let dir = TempDir::new().unwrap();
        let journal = formatted(&dir);
        journal.start_segment(1).unwrap();
        journal.write(1, &batch(1, 3)).unwrap();
        journal.finalize_segment(1, 3).unwrap();

        assert!(journal.start_segment(2).is_err());
        journal.start_segment(4).unwrap();
    }

    #[test]
    fn test_in_progress_segment_listing() {
        let dir = TempDir::new().unwrap();
        let journal = formatted(&dir);
        journal.start_segment(1).unwrap();
        assert!(journal.segments(0, true).unwrap().is_empty());

        journal.write(1, &batch(1, 4)).unwrap();
        assert_eq!(
            journal.segments(0, true).unwrap(),
            vec![LogSegment::in_progress(1, 4)]
        );
        assert!(journal.segments(0, false).unwrap().is_empty());
        assert!(journal.segments(5, true).unwrap().is_empty());
    }

    #[test]
    fn test_recover_after_crash() {
        let dir = TempDir::new().unwrap();
        {
            let journal = formatted(&dir);
            journal.start_segment(1).unwrap();
            journal.write(1, &batch(1, 3)).unwrap();
        }

        // Torn tail from a write that never completed.
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(dir.path().join(in_progress_filename(1)))
                .unwrap();
            file.write_all(b"QLOG\x01\x00").unwrap();
        }

        let journal = FileJournal::open("j1", dir.path()).unwrap();
        let recovered = journal.recover_unfinalized().unwrap();
        assert_eq!(recovered, vec![LogSegment::finalized(1, 3)]);
        assert_eq!(journal.read_segment(1).unwrap().len(), 3);
    }

    #[test]
    fn test_recover_aborts_empty_segment() {
        let dir = TempDir::new().unwrap();
        {
            let journal = formatted(&dir);
            journal.start_segment(7).unwrap();
        }

        let journal = FileJournal::open("j1", dir.path()).unwrap();
        let recovered = journal.recover_unfinalized().unwrap();
        assert_eq!(recovered, vec![LogSegment::aborted(7)]);
        assert!(dir.path().join(aborted_filename(7)).exists());
    }

    #[test]
    fn test_abort_and_restart() {
        let dir = TempDir::new().unwrap();
        let journal = formatted(&dir);
        journal.start_segment(1).unwrap();
        journal.abort_segment(1).unwrap();
        assert!(journal.segments(0, true).unwrap().is_empty());

        journal.start_segment(1).unwrap();
        journal.write(1, &batch(1, 1)).unwrap();
        journal.finalize_segment(1, 1).unwrap();
    }

    #[test]
    fn test_purge_before() {
        let dir = TempDir::new().unwrap();
        let journal = formatted(&dir);
        for start in [1u64, 4, 7] {
            journal.start_segment(start).unwrap();
            journal.write(start, &batch(start, 3)).unwrap();
            journal.finalize_segment(start, start + 2).unwrap();
        }

        assert_eq!(journal.purge_before(7).unwrap(), 2);
        assert_eq!(journal.segments(0, false).unwrap(), vec![LogSegment::finalized(7, 9)]);
    }

    #[test]
    fn test_lagging_segment_closed_on_start() {
        let dir = TempDir::new().unwrap();
        let journal = formatted(&dir);
        journal.start_segment(1).unwrap();
        journal.write(1, &batch(1, 2)).unwrap();

        journal.start_segment(10).unwrap();
        assert_eq!(journal.segments(0, false).unwrap(), vec![LogSegment::finalized(1, 2)]);
    }
}
