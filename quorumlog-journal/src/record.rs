//! Transaction records.
//!
//! Each record has the following on-disk format:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | kind     | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | txid                | payload                                   |
//! | 8 bytes             | length bytes                              |
//! +---------------------+-------------------------------------------+
//! ```
//!
//! The payload is opaque to the log.

use crate::error::JournalError;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Magic bytes for transaction records: "QLOG"
pub const RECORD_MAGIC: [u8; 4] = *b"QLOG";

/// Maximum record payload size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Kind of transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxKind {
    /// Ordinary namespace mutation.
    Op = 1,
    /// First transaction of a segment.
    StartSegment = 2,
    /// Last transaction of a segment.
    EndSegment = 3,
}

impl TxKind {
    /// Returns whether this kind marks a segment boundary.
    pub fn is_boundary(&self) -> bool {
        matches!(self, TxKind::StartSegment | TxKind::EndSegment)
    }
}

impl TryFrom<u8> for TxKind {
    type Error = JournalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TxKind::Op),
            2 => Ok(TxKind::StartSegment),
            3 => Ok(TxKind::EndSegment),
            _ => Err(JournalError::InvalidHeader {
                offset: 0,
                reason: format!("unknown transaction kind: {}", value),
            }),
        }
    }
}

/// A parsed record header.
#[derive(Debug, Clone)]
pub struct TxRecordHeader {
    pub kind: TxKind,
    pub flags: u8,
    pub payload_len: u32,
    pub crc32c: u32,
    pub txid: u64,
}

/// A complete record (header + payload).
#[derive(Debug, Clone)]
pub struct TxRecord {
    pub header: TxRecordHeader,
    pub payload: Bytes,
}

impl TxRecord {
    /// Creates a new record.
    pub fn new(kind: TxKind, txid: u64, payload: Bytes) -> Self {
        let crc = crc32c::crc32c(&payload);
        Self {
            header: TxRecordHeader {
                kind,
                flags: 0,
                payload_len: payload.len() as u32,
                crc32c: crc,
                txid,
            },
            payload,
        }
    }

    /// Appends the encoded record to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), JournalError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(JournalError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        buf.reserve(self.disk_size());
        buf.put_slice(&RECORD_MAGIC);
        buf.put_u8(self.header.kind as u8);
        buf.put_u8(self.header.flags);
        buf.put_u16(0);
        buf.put_u32(self.header.payload_len);
        buf.put_u32(self.header.crc32c);
        buf.put_u64(self.header.txid);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Encodes the record into a fresh buffer.
    pub fn encode(&self) -> Result<BytesMut, JournalError> {
        let mut buf = BytesMut::with_capacity(self.disk_size());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a record from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a record.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, JournalError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        if buf[0..4] != RECORD_MAGIC {
            // Preallocated tail
            if buf[0..4] == [0, 0, 0, 0] {
                return Ok(None);
            }
            return Err(JournalError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", &buf[0..4]),
            });
        }

        let kind = TxKind::try_from(buf[4]).map_err(|_| JournalError::InvalidHeader {
            offset,
            reason: format!("unknown transaction kind: {}", buf[4]),
        })?;

        let flags = buf[5];
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let txid = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);

        if payload_len > MAX_RECORD_SIZE {
            return Err(JournalError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }

        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(JournalError::CorruptedRecord {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self {
            header: TxRecordHeader {
                kind,
                flags,
                payload_len: payload_len as u32,
                crc32c: crc_expected,
                txid,
            },
            payload,
        }))
    }

    /// Returns the total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    /// Converts the record into a transaction.
    pub fn into_transaction(self) -> Transaction {
        Transaction {
            txid: self.header.txid,
            kind: self.header.kind,
            payload: self.payload,
        }
    }
}

/// One logged transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub txid: u64,
    pub kind: TxKind,
    pub payload: Bytes,
}

impl Transaction {
    pub fn new(txid: u64, kind: TxKind, payload: impl Into<Bytes>) -> Self {
        Self {
            txid,
            kind,
            payload: payload.into(),
        }
    }

    /// Returns the record for this transaction.
    pub fn to_record(&self) -> TxRecord {
        TxRecord::new(self.kind, self.txid, self.payload.clone())
    }
}

/// A contiguous range of encoded records handed to the targets in one write.
#[derive(Debug, Clone)]
pub struct TxBatch {
    pub first_txid: u64,
    pub num_txns: u64,
    pub data: Bytes,
}

impl TxBatch {
    pub fn new(first_txid: u64, num_txns: u64, data: Bytes) -> Self {
        Self {
            first_txid,
            num_txns,
            data,
        }
    }

    /// Encodes a run of transactions into one batch.
    ///
    /// The transactions must carry consecutive txids.
    pub fn from_transactions(txns: &[Transaction]) -> Result<Self, JournalError> {
        let first_txid = txns.first().map(|t| t.txid).unwrap_or(crate::INVALID_TXID);
        let mut data = BytesMut::new();
        for (i, txn) in txns.iter().enumerate() {
            if txn.txid != first_txid + i as u64 {
                return Err(JournalError::InvalidState(format!(
                    "non-consecutive txid {} in batch starting at {}",
                    txn.txid, first_txid
                )));
            }
            txn.to_record().encode_into(&mut data)?;
        }
        Ok(Self::new(first_txid, txns.len() as u64, data.freeze()))
    }

    /// Last txid in the batch. Only meaningful when the batch is not empty.
    pub fn last_txid(&self) -> u64 {
        self.first_txid + self.num_txns - 1
    }

    pub fn is_empty(&self) -> bool {
        self.num_txns == 0
    }

    /// Decodes every record in the batch, checking txid continuity.
    pub fn decode(&self) -> Result<Vec<Transaction>, JournalError> {
        let mut buf = BytesMut::from(&self.data[..]);
        let mut txns = Vec::with_capacity(self.num_txns as usize);
        let mut offset = 0u64;
        while !buf.is_empty() {
            let record = TxRecord::decode(&mut buf, offset)?.ok_or_else(|| {
                JournalError::InvalidHeader {
                    offset,
                    reason: "truncated record in batch".to_string(),
                }
            })?;
            offset += record.disk_size() as u64;
            let expected = self.first_txid + txns.len() as u64;
            if record.header.txid != expected {
                return Err(JournalError::Defect(format!(
                    "batch record has txid {} but {} was expected",
                    record.header.txid, expected
                )));
            }
            txns.push(record.into_transaction());
        }
        if txns.len() as u64 != self.num_txns {
            return Err(JournalError::Defect(format!(
                "batch declares {} transactions but holds {}",
                self.num_txns,
                txns.len()
            )));
        }
        Ok(txns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_record_roundtrip() {
        let payload = Bytes::from_static(b"mkdir /a");
        let record = TxRecord::new(TxKind::Op, 42, payload.clone());

        let mut buf = record.encode().unwrap();
        let decoded = TxRecord::decode(&mut buf, 0).unwrap().unwrap();

        assert_eq!(decoded.header.kind, TxKind::Op);
        assert_eq!(decoded.header.txid, 42);
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_corrupted_record_detection() {
        let record = TxRecord::new(TxKind::Op, 1, Bytes::from_static(b"rename /a /b"));
        let mut encoded = record.encode().unwrap();

        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = TxRecord::decode(&mut encoded, 0);
        assert!(matches!(result, Err(JournalError::CorruptedRecord { .. })));
    }

    #[test]
    fn test_incomplete_record() {
        let mut buf = BytesMut::from(&b"QLOG"[..]);
        assert!(TxRecord::decode(&mut buf, 0).unwrap().is_none());

        let record = TxRecord::new(TxKind::Op, 9, Bytes::from_static(b"payload"));
        let encoded = record.encode().unwrap();
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 2]);
        assert!(TxRecord::decode(&mut partial, 0).unwrap().is_none());
    }

    #[test]
    fn test_zero_fill_is_end_of_data() {
        let mut buf = BytesMut::from(&[0u8; 24][..]);
        assert!(TxRecord::decode(&mut buf, 0).unwrap().is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&b"BADX\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x01"[..]);
        let result = TxRecord::decode(&mut buf, 0);
        assert!(matches!(result, Err(JournalError::InvalidHeader { .. })));
    }

    #[test]
    fn test_kind_conversion() {
        assert_eq!(TxKind::try_from(1u8).unwrap(), TxKind::Op);
        assert_eq!(TxKind::try_from(2u8).unwrap(), TxKind::StartSegment);
        assert_eq!(TxKind::try_from(3u8).unwrap(), TxKind::EndSegment);
        assert!(TxKind::try_from(0u8).is_err());
        assert!(TxKind::StartSegment.is_boundary());
        assert!(!TxKind::Op.is_boundary());
    }

    #[test]
    fn test_record_too_large() {
        let record = TxRecord::new(TxKind::Op, 1, Bytes::from(vec![0u8; MAX_RECORD_SIZE + 1]));
        assert!(matches!(
            record.encode(),
            Err(JournalError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_batch_decode_checks_continuity() {
        let txns = vec![
            Transaction::new(5, TxKind::StartSegment, Bytes::new()),
            Transaction::new(6, TxKind::Op, Bytes::from_static(b"a")),
            Transaction::new(7, TxKind::Op, Bytes::from_static(b"b")),
        ];
        let batch = TxBatch::from_transactions(&txns).unwrap();
        assert_eq!(batch.first_txid, 5);
        assert_eq!(batch.last_txid(), 7);
        assert_eq!(batch.decode().unwrap(), txns);

        let bad = TxBatch::new(6, 3, batch.data.clone());
        assert!(matches!(bad.decode(), Err(JournalError::Defect(_))));
    }

    #[test]
    fn test_batch_rejects_gaps() {
        let txns = vec![
            Transaction::new(1, TxKind::Op, Bytes::new()),
            Transaction::new(3, TxKind::Op, Bytes::new()),
        ];
        assert!(TxBatch::from_transactions(&txns).is_err());
    }

    proptest! {
        #[test]
        fn test_any_payload_bit_flip_detected(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let record = TxRecord::new(TxKind::Op, 7, Bytes::from(payload.clone()));
            let mut encoded = record.encode().unwrap();
            let at = RECORD_HEADER_SIZE + index.index(payload.len());
            encoded[at] ^= 1 << bit;

            let result = TxRecord::decode(&mut encoded, 0);
            prop_assert!(
                matches!(result, Err(JournalError::CorruptedRecord { .. })),
                "expected corruption, got {:?}",
                result.map(|r| r.map(|r| r.header.txid))
            );
        }
    }
}
