//! Segment recovery.
//!
//! A crash can leave an in-progress segment with a torn tail: a partial
//! record, a record with a bad checksum, or zero-filled space. Scanning
//! stops at the first record that is invalid or does not continue the txid
//! sequence; everything after it is discarded when repairing.

use crate::error::JournalError;
use crate::record::{TxKind, TxRecord};
use crate::segment::{list_segments, LogSegment, SegmentFile, SegmentStatus};
use crate::RECORD_HEADER_SIZE;
use bytes::BytesMut;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Result of scanning one segment file.
#[derive(Debug, Clone, Default)]
pub struct SegmentScan {
    /// Number of valid records found.
    pub valid_records: u64,
    /// Number of records rejected (checksum, header or txid order).
    pub invalid_records: u64,
    /// Bytes after the last valid record.
    pub bytes_truncated: u64,
    /// First valid txid, if any.
    pub first_txid: Option<u64>,
    /// Last valid txid, if any.
    pub last_txid: Option<u64>,
    /// Whether the last valid record is an end-of-segment marker.
    pub ends_with_end_marker: bool,
    /// Offset just past the last valid record.
    pub valid_len: u64,
}

/// Result of scanning a whole journal directory.
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Number of valid records found.
    pub valid_records: u64,
    /// Number of corrupted/partial records found.
    pub invalid_records: u64,
    /// Bytes truncated (or that would be) due to torn tails.
    pub bytes_truncated: u64,
    /// Segments whose tails were repaired.
    pub segments_recovered: Vec<LogSegment>,
    /// Segments that could not be scanned.
    pub segments_with_errors: Vec<(LogSegment, String)>,
    /// Highest valid txid found.
    pub max_txid: u64,
}

/// Scans segment files for their valid prefix.
pub struct RecoveryScanner {
    dir: PathBuf,
}

impl RecoveryScanner {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Scans every non-aborted segment in the directory, optionally
    /// truncating torn tails.
    pub fn scan(&self, repair: bool) -> Result<RecoveryResult, JournalError> {
        let mut result = RecoveryResult::default();

        for (segment, path) in list_segments(&self.dir)? {
            if segment.status == SegmentStatus::Aborted {
                continue;
            }
            match scan_segment_file(&path, segment.start_txid, repair) {
                Ok(scan) => {
                    result.valid_records += scan.valid_records;
                    result.invalid_records += scan.invalid_records;
                    result.bytes_truncated += scan.bytes_truncated;
                    if let Some(last) = scan.last_txid {
                        result.max_txid = result.max_txid.max(last);
                    }
                    if scan.invalid_records > 0 || scan.bytes_truncated > 0 {
                        result.segments_recovered.push(segment);
                    }
                    if segment.is_finalized() && scan.last_txid != Some(segment.end_txid) {
                        result.segments_with_errors.push((
                            segment,
                            format!(
                                "finalized segment ends at {:?}, expected {}",
                                scan.last_txid, segment.end_txid
                            ),
                        ));
                    }
                }
                Err(e) => {
                    result.segments_with_errors.push((segment, e.to_string()));
                }
            }
        }

        Ok(result)
    }
}

/// Scans one segment file whose first record should carry `start_txid`.
pub fn scan_segment_file(
    path: &Path,
    start_txid: u64,
    repair: bool,
) -> Result<SegmentScan, JournalError> {
    let mut data = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut data)?;
    let file_size = data.len() as u64;

    let mut buf = BytesMut::from(&data[..]);
    let mut scan = SegmentScan::default();
    let mut offset = 0u64;
    let mut expected_txid = start_txid;

    while buf.len() >= RECORD_HEADER_SIZE {
        match TxRecord::decode(&mut buf, offset) {
            Ok(Some(record)) => {
                if record.header.txid != expected_txid {
                    scan.invalid_records += 1;
                    tracing::warn!(
                        "Segment {} has txid {} at offset {}, expected {}",
                        path.display(),
                        record.header.txid,
                        offset,
                        expected_txid
                    );
                    break;
                }
                scan.first_txid.get_or_insert(record.header.txid);
                scan.last_txid = Some(record.header.txid);
                scan.ends_with_end_marker = record.header.kind == TxKind::EndSegment;
                scan.valid_records += 1;
                expected_txid += 1;
                offset += record.disk_size() as u64;
                scan.valid_len = offset;
            }
            // Partial record at the end
            Ok(None) => break,
            Err(JournalError::CorruptedRecord { .. }) | Err(JournalError::InvalidHeader { .. }) => {
                scan.invalid_records += 1;
                break;
            }
            Err(JournalError::RecordTooLarge { .. }) => {
                scan.invalid_records += 1;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    scan.bytes_truncated = file_size - scan.valid_len;

    if repair && scan.bytes_truncated > 0 {
        let mut file = SegmentFile::open(path)?;
        file.truncate_at(scan.valid_len)?;
        tracing::warn!(
            "Truncated segment {} at offset {} (removed {} bytes)",
            path.display(),
            scan.valid_len,
            scan.bytes_truncated
        );
    }

    Ok(scan)
}

/// Verifies a journal directory without modifying anything.
pub fn verify_dir(dir: impl AsRef<Path>) -> Result<RecoveryResult, JournalError> {
    RecoveryScanner::new(dir).scan(false)
}

/// Repairs a journal directory by truncating torn tails.
pub fn repair_dir(dir: impl AsRef<Path>) -> Result<RecoveryResult, JournalError> {
    RecoveryScanner::new(dir).scan(true)
}
