//! Journal record codec and segment recovery benchmarks.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quorumlog_journal::recovery::verify_dir;
use quorumlog_journal::{
    FileJournal, JournalSet, JournalSetConfig, JournalTarget, Transaction, TxBatch, TxKind,
    TxRecord,
};
use std::sync::Arc;
use tempfile::TempDir;

fn bench_record_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_encode");

    for size in [100, 1000, 10000] {
        let record = TxRecord::new(TxKind::Op, 42, Bytes::from("x".repeat(size)));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &record, |b, record| {
            b.iter(|| black_box(record.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_record_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_decode");

    for size in [100, 1000, 10000] {
        let record = TxRecord::new(TxKind::Op, 42, Bytes::from("x".repeat(size)));
        let encoded = record.encode().unwrap().freeze();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                black_box(TxRecord::decode(&mut buf, 0).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_batch_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_encode");

    for count in [10, 100, 1000] {
        let txns: Vec<Transaction> = (1..=count)
            .map(|txid| Transaction::new(txid, TxKind::Op, "x".repeat(100)))
            .collect();
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &txns, |b, txns| {
            b.iter(|| black_box(TxBatch::from_transactions(txns).unwrap()));
        });
    }

    group.finish();
}

fn bench_verify_dir(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify_dir");
    group.sample_size(10);

    for count in [1000u64, 10000] {
        let dir = TempDir::new().unwrap();
        let journal: Arc<dyn JournalTarget> =
            Arc::new(FileJournal::open("bench", dir.path()).unwrap());
        let set = JournalSet::new(vec![journal], JournalSetConfig::new(1)).unwrap();
        set.format().unwrap();
        set.start_segment(1).unwrap();
        let txns: Vec<Transaction> = (1..=count)
            .map(|txid| {
                let kind = if txid == 1 {
                    TxKind::StartSegment
                } else {
                    TxKind::Op
                };
                Transaction::new(txid, kind, "x".repeat(100))
            })
            .collect();
        set.write(TxBatch::from_transactions(&txns).unwrap()).unwrap();
        set.close().unwrap();

        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), dir.path(), |b, path| {
            b.iter(|| black_box(verify_dir(path).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_record_encode,
    bench_record_decode,
    bench_batch_encode,
    bench_verify_dir,
);

criterion_main!(benches);
