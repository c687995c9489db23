//! Log segments and segment files.
//!
//! A segment is a contiguous range of transactions between a start marker
//! and an end marker. On disk each segment is one file whose name encodes
//! its range and status:
//! - `<start>.inprogress` while being written
//! - `<start>-<end>.log` once finalized
//! - `<start>.aborted` when abandoned

use crate::error::JournalError;
use crate::record::TxRecord;
use crate::RECORD_HEADER_SIZE;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Lifecycle status of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    InProgress,
    Finalized,
    Aborted,
}

/// A contiguous range of transactions.
///
/// For an in-progress segment `end_txid` is the last durable txid, or
/// `start_txid - 1` while the segment is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogSegment {
    pub start_txid: u64,
    pub end_txid: u64,
    pub status: SegmentStatus,
}

impl LogSegment {
    pub fn in_progress(start_txid: u64, end_txid: u64) -> Self {
        Self {
            start_txid,
            end_txid,
            status: SegmentStatus::InProgress,
        }
    }

    pub fn finalized(start_txid: u64, end_txid: u64) -> Self {
        Self {
            start_txid,
            end_txid,
            status: SegmentStatus::Finalized,
        }
    }

    pub fn aborted(start_txid: u64) -> Self {
        Self {
            start_txid,
            end_txid: start_txid.saturating_sub(1),
            status: SegmentStatus::Aborted,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == SegmentStatus::InProgress
    }

    pub fn is_finalized(&self) -> bool {
        self.status == SegmentStatus::Finalized
    }

    /// Number of transactions in the segment.
    pub fn txn_count(&self) -> u64 {
        (self.end_txid + 1).saturating_sub(self.start_txid)
    }

    pub fn is_empty(&self) -> bool {
        self.txn_count() == 0
    }

    /// Returns whether `txid` falls inside the segment.
    pub fn contains(&self, txid: u64) -> bool {
        self.status != SegmentStatus::Aborted && txid >= self.start_txid && txid <= self.end_txid
    }
}

impl std::fmt::Display for LogSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            SegmentStatus::InProgress => write!(f, "[{}, {}] in progress", self.start_txid, self.end_txid),
            SegmentStatus::Finalized => write!(f, "[{}, {}]", self.start_txid, self.end_txid),
            SegmentStatus::Aborted => write!(f, "[{}] aborted", self.start_txid),
        }
    }
}

/// File name for an in-progress segment.
pub fn in_progress_filename(start: u64) -> String {
    format!("{:016x}.inprogress", start)
}

/// File name for a finalized segment.
pub fn finalized_filename(start: u64, end: u64) -> String {
    format!("{:016x}-{:016x}.log", start, end)
}

/// File name for an aborted segment.
pub fn aborted_filename(start: u64) -> String {
    format!("{:016x}.aborted", start)
}

/// Parses a segment file name.
///
/// In-progress segments are returned with `end_txid = start - 1`; the real
/// end has to be found by scanning the file.
pub fn parse_segment_filename(name: &str) -> Option<LogSegment> {
    if let Some(stem) = name.strip_suffix(".inprogress") {
        let start = parse_hex(stem)?;
        return Some(LogSegment::in_progress(start, start.saturating_sub(1)));
    }
    if let Some(stem) = name.strip_suffix(".aborted") {
        return Some(LogSegment::aborted(parse_hex(stem)?));
    }
    let stem = name.strip_suffix(".log")?;
    let (start, end) = stem.split_once('-')?;
    let (start, end) = (parse_hex(start)?, parse_hex(end)?);
    if end < start {
        return None;
    }
    Some(LogSegment::finalized(start, end))
}

fn parse_hex(s: &str) -> Option<u64> {
    if s.len() != 16 {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

/// Lists every segment file in a directory, sorted by start txid.
pub fn list_segments(dir: &Path) -> Result<Vec<(LogSegment, PathBuf)>, JournalError> {
    let mut segments = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(segment) = parse_segment_filename(&name) {
            segments.push((segment, entry.path()));
        }
    }

    segments.sort_by_key(|(s, _)| (s.start_txid, s.end_txid));
    Ok(segments)
}

/// A single segment file.
pub struct SegmentFile {
    path: PathBuf,
    file: File,
    size: u64,
    sync_pending: bool,
}

impl SegmentFile {
    /// Creates a new segment file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            path,
            file,
            size: 0,
            sync_pending: false,
        })
    }

    /// Opens an existing segment file for reading and appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            size,
            sync_pending: false,
        })
    }

    /// Returns the segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current size of the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends already-encoded records. Returns the offset they start at.
    pub fn append(&mut self, encoded: &[u8]) -> Result<u64, JournalError> {
        let offset = self.size;

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(encoded)?;
        self.size += encoded.len() as u64;
        self.sync_pending = true;

        Ok(offset)
    }

    /// Syncs the file to disk.
    pub fn sync(&mut self) -> Result<(), JournalError> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
        }
        Ok(())
    }

    /// Reads all records from the file.
    pub fn read_all(&mut self) -> Result<Vec<(u64, TxRecord)>, JournalError> {
        let mut records = Vec::new();
        let mut offset = 0u64;

        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&self.file);
        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; 8192];

        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(e.into()),
            }

            while buf.len() >= RECORD_HEADER_SIZE {
                match TxRecord::decode(&mut buf, offset)? {
                    Some(record) => {
                        let record_size = record.disk_size();
                        records.push((offset, record));
                        offset += record_size as u64;
                    }
                    None => break,
                }
            }
        }

        Ok(records)
    }

    /// Truncates the file at the given offset (for recovery from partial writes).
    pub fn truncate_at(&mut self, offset: u64) -> Result<(), JournalError> {
        self.file.set_len(offset)?;
        self.size = offset;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_all()?;
        self.sync_pending = false;
        Ok(())
    }

    /// Syncs and renames the file, returning the reopened handle.
    pub fn rename(mut self, to: impl Into<PathBuf>) -> Result<Self, JournalError> {
        self.sync()?;
        let to = to.into();
        std::fs::rename(&self.path, &to)?;
        sync_parent(&to)?;
        self.path = to;
        Ok(self)
    }
}

/// Syncs the directory containing `path` so a rename survives a crash.
pub(crate) fn sync_parent(path: &Path) -> Result<(), JournalError> {
    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        File::open(parent)?.sync_all()?;
        #[cfg(not(unix))]
        let _ = parent;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TxKind;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[test]
    fn test_segment_filenames() {
        assert_eq!(in_progress_filename(1), "0000000000000001.inprogress");
        assert_eq!(
            finalized_filename(1, 255),
            "0000000000000001-00000000000000ff.log"
        );
        assert_eq!(aborted_filename(16), "0000000000000010.aborted");
    }

    #[test]
    fn test_parse_segment_filename() {
        assert_eq!(
            parse_segment_filename("0000000000000001-00000000000000ff.log"),
            Some(LogSegment::finalized(1, 255))
        );
        assert_eq!(
            parse_segment_filename("0000000000000100.inprogress"),
            Some(LogSegment::in_progress(256, 255))
        );
        assert_eq!(
            parse_segment_filename("0000000000000100.aborted"),
            Some(LogSegment::aborted(256))
        );
        assert_eq!(parse_segment_filename("VERSION"), None);
        assert_eq!(parse_segment_filename("0000000000000009-0000000000000001.log"), None);
        assert_eq!(parse_segment_filename("01-02.log"), None);
    }

    #[test]
    fn test_log_segment_ranges() {
        let seg = LogSegment::finalized(10, 19);
        assert_eq!(seg.txn_count(), 10);
        assert!(seg.contains(10));
        assert!(seg.contains(19));
        assert!(!seg.contains(20));

        let empty = LogSegment::in_progress(20, 19);
        assert!(empty.is_empty());
        assert!(!empty.contains(20));

        assert!(!LogSegment::aborted(5).contains(5));
    }

    #[test]
    fn test_segment_file_append_and_read() {
        let dir = TempDir::new().unwrap();
        let mut file = SegmentFile::create(dir.path().join(in_progress_filename(1))).unwrap();

        for txid in 1..=5 {
            let record = TxRecord::new(TxKind::Op, txid, Bytes::from(format!("op-{}", txid)));
            file.append(&record.encode().unwrap()).unwrap();
        }
        file.sync().unwrap();

        let records = file.read_all().unwrap();
        assert_eq!(records.len(), 5);
        for (i, (_, record)) in records.iter().enumerate() {
            assert_eq!(record.header.txid, i as u64 + 1);
        }
    }

    #[test]
    fn test_rename_and_list() {
        let dir = TempDir::new().unwrap();
        let file = SegmentFile::create(dir.path().join(in_progress_filename(1))).unwrap();
        file.rename(dir.path().join(finalized_filename(1, 3))).unwrap();
        SegmentFile::create(dir.path().join(in_progress_filename(4))).unwrap();

        let segments: Vec<LogSegment> = list_segments(dir.path())
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(
            segments,
            vec![LogSegment::finalized(1, 3), LogSegment::in_progress(4, 3)]
        );
    }
}
