//! Write buffer for pending transactions.

use bytes::BytesMut;
use quorumlog_journal::{JournalError, Transaction, TxBatch};

/// Encoded transactions waiting for the next sync.
///
/// Holds a contiguous txid range. [`EditBuffer::take`] hands the contents
/// off as a batch and leaves an empty buffer behind, so appends can continue
/// while the batch is being flushed.
#[derive(Debug)]
pub struct EditBuffer {
    data: BytesMut,
    first_txid: u64,
    num_txns: u64,
    capacity: usize,
}

impl EditBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            first_txid: 0,
            num_txns: 0,
            capacity,
        }
    }

    /// Buffered bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_txns == 0
    }

    pub fn num_txns(&self) -> u64 {
        self.num_txns
    }

    /// Whether the buffer has reached its sync threshold.
    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    /// Appends one transaction. Its txid must follow the buffered range.
    pub fn write(&mut self, txn: &Transaction) -> Result<(), JournalError> {
        self.check_next(txn.txid)?;
        txn.to_record().encode_into(&mut self.data)?;
        if self.num_txns == 0 {
            self.first_txid = txn.txid;
        }
        self.num_txns += 1;
        Ok(())
    }

    /// Appends an already-encoded batch.
    pub fn write_batch(&mut self, batch: &TxBatch) -> Result<(), JournalError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.check_next(batch.first_txid)?;
        self.data.extend_from_slice(&batch.data);
        if self.num_txns == 0 {
            self.first_txid = batch.first_txid;
        }
        self.num_txns += batch.num_txns;
        Ok(())
    }

    /// Hands off the buffered transactions, leaving the buffer empty.
    pub fn take(&mut self) -> Option<TxBatch> {
        if self.num_txns == 0 {
            return None;
        }
        let batch = TxBatch::new(self.first_txid, self.num_txns, self.data.split().freeze());
        if self.data.capacity() < self.capacity {
            self.data.reserve(self.capacity);
        }
        self.num_txns = 0;
        Some(batch)
    }

    /// Discards the buffered transactions. Returns how many were dropped.
    pub fn clear(&mut self) -> u64 {
        let dropped = self.num_txns;
        self.data.clear();
        self.num_txns = 0;
        dropped
    }

    fn check_next(&self, txid: u64) -> Result<(), JournalError> {
        if self.num_txns > 0 && txid != self.first_txid + self.num_txns {
            return Err(JournalError::Defect(format!(
                "txid {} does not follow buffered range starting at {} ({} transactions)",
                txid, self.first_txid, self.num_txns
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use quorumlog_journal::TxKind;

    fn op(txid: u64) -> Transaction {
        Transaction::new(txid, TxKind::Op, format!("op-{}", txid))
    }

    #[test]
    fn test_take_swaps_out_contents() {
        let mut buffer = EditBuffer::new(1024);
        assert!(buffer.take().is_none());

        buffer.write(&op(1)).unwrap();
        buffer.write(&op(2)).unwrap();
        let batch = buffer.take().unwrap();
        assert_eq!(batch.first_txid, 1);
        assert_eq!(batch.num_txns, 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);

        buffer.write(&op(3)).unwrap();
        let batch = buffer.take().unwrap();
        assert_eq!(batch.first_txid, 3);
        assert_eq!(batch.decode().unwrap(), vec![op(3)]);
    }

    #[test]
    fn test_non_consecutive_write_rejected() {
        let mut buffer = EditBuffer::new(1024);
        buffer.write(&op(1)).unwrap();
        assert!(matches!(buffer.write(&op(3)), Err(JournalError::Defect(_))));
    }

    #[test]
    fn test_is_full() {
        let mut buffer = EditBuffer::new(64);
        buffer.write(&op(1)).unwrap();
        assert!(!buffer.is_full());
        buffer.write(&op(2)).unwrap();
        buffer.write(&op(3)).unwrap();
        assert!(buffer.is_full());
    }

    #[test]
    fn test_write_batch_and_clear() {
        let mut buffer = EditBuffer::new(1024);
        buffer.write(&op(1)).unwrap();
        let batch = TxBatch::from_transactions(&[op(2), op(3)]).unwrap();
        buffer.write_batch(&batch).unwrap();
        assert_eq!(buffer.num_txns(), 3);

        assert_eq!(buffer.clear(), 3);
        assert!(buffer.take().is_none());
    }

    proptest! {
        #[test]
        fn test_takes_preserve_order(take_after in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut buffer = EditBuffer::new(128);
            let mut seen = Vec::new();
            for (i, take) in take_after.iter().enumerate() {
                buffer.write(&op(i as u64 + 1)).unwrap();
                if *take {
                    seen.extend(buffer.take().unwrap().decode().unwrap());
                }
            }
            if let Some(batch) = buffer.take() {
                seen.extend(batch.decode().unwrap());
            }

            let txids: Vec<u64> = seen.iter().map(|t| t.txid).collect();
            prop_assert_eq!(txids, (1..=take_after.len() as u64).collect::<Vec<_>>());
        }
    }
}
