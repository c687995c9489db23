//! Edit log benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quorumlog_core::{EditLog, EditLogConfig};
use quorumlog_journal::{FileJournal, JournalSet, JournalSetConfig, JournalTarget, MemoryJournal};
use std::sync::Arc;
use tempfile::TempDir;

fn create_memory_log(targets: usize, quorum: usize) -> EditLog {
    let targets: Vec<Arc<dyn JournalTarget>> = (0..targets)
        .map(|i| Arc::new(MemoryJournal::new(format!("mem-{}", i))) as Arc<dyn JournalTarget>)
        .collect();
    let set = Arc::new(JournalSet::new(targets, JournalSetConfig::new(quorum)).unwrap());
    let log = EditLog::new(set, EditLogConfig::default());
    log.init_for_write().unwrap();
    log.open_for_write().unwrap();
    log
}

fn create_file_log(targets: usize, quorum: usize) -> (Vec<TempDir>, EditLog) {
    let dirs: Vec<TempDir> = (0..targets).map(|_| TempDir::new().unwrap()).collect();
    let journals: Vec<Arc<dyn JournalTarget>> = dirs
        .iter()
        .enumerate()
        .map(|(i, dir)| {
            Arc::new(FileJournal::open(format!("file-{}", i), dir.path()).unwrap())
                as Arc<dyn JournalTarget>
        })
        .collect();
    let set = Arc::new(JournalSet::new(journals, JournalSetConfig::new(quorum)).unwrap());
    set.format().unwrap();
    let log = EditLog::new(set, EditLogConfig::default());
    log.init_for_write().unwrap();
    log.open_for_write().unwrap();
    (dirs, log)
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_transaction");

    let log = create_memory_log(3, 2);
    for size in [64, 1024, 16 * 1024] {
        let payload = Bytes::from("x".repeat(size));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                let appended = log.append_transaction(payload.clone()).unwrap();
                if appended.needs_sync {
                    log.sync(appended.txid).unwrap();
                }
                black_box(appended.txid)
            });
        });
    }

    group.finish();
}

fn bench_batched_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("batched_sync");

    let log = create_memory_log(3, 2);
    let payload = Bytes::from("x".repeat(100));
    for batch_size in [1, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &size| {
                b.iter(|| {
                    let mut last = 0;
                    for _ in 0..size {
                        last = log.log_edit(payload.clone()).unwrap();
                    }
                    log.sync(last).unwrap();
                    black_box(last)
                });
            },
        );
    }

    group.finish();
}

fn bench_group_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_commit");
    group.sample_size(20);

    let log = create_memory_log(3, 2);
    let payload = Bytes::from("x".repeat(100));
    const EDITS_PER_THREAD: usize = 100;

    for threads in [1, 4, 16] {
        group.throughput(Throughput::Elements((threads * EDITS_PER_THREAD) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    std::thread::scope(|s| {
                        for _ in 0..threads {
                            s.spawn(|| {
                                for _ in 0..EDITS_PER_THREAD {
                                    let txid = log.log_edit(payload.clone()).unwrap();
                                    log.sync(txid).unwrap();
                                }
                            });
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

fn bench_file_journals(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_journals");
    group.sample_size(10);

    let (_dirs, log) = create_file_log(3, 2);
    let payload = Bytes::from("x".repeat(100));
    for batch_size in [1, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("edits_per_sync", batch_size),
            &batch_size,
            |b, &size| {
                b.iter(|| {
                    let mut last = 0;
                    for _ in 0..size {
                        last = log.log_edit(payload.clone()).unwrap();
                    }
                    log.sync(last).unwrap();
                    black_box(last)
                });
            },
        );
    }

    group.finish();
}

fn bench_roll_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("roll_log");

    let log = create_memory_log(3, 2);
    group.bench_function("empty_segment", |b| {
        b.iter(|| black_box(log.roll_log().unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_append,
    bench_batched_sync,
    bench_group_commit,
    bench_file_journals,
    bench_roll_log,
);

criterion_main!(benches);
