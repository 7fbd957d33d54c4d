//! Persistence benchmarks: journaled mutations and reload.

use chartd_core::{List, Map, Value, ValueKind};
use chartd_storage::{Bucket, FileStorage, FsyncPolicy, ReferenceTracker, Storage};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tempfile::TempDir;

fn tracked_map(bucket: &Bucket) -> (ReferenceTracker, Map) {
    let tracker = ReferenceTracker::new(bucket.clone());
    let map = Map::new();
    tracker.add_reference(&Value::Map(map.clone())).unwrap();
    (tracker, map)
}

fn bench_map_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage_map_set");
    group.throughput(Throughput::Elements(1));

    let bucket = Bucket::in_memory();
    let (_tracker, map) = tracked_map(&bucket);
    let mut n = 0u64;
    group.bench_function("scalar", |b| {
        b.iter(|| {
            n += 1;
            map.set("counter", Value::from(n as f64)).unwrap();
        });
    });

    let bucket = Bucket::in_memory();
    let (_tracker, map) = tracked_map(&bucket);
    group.bench_function("nested_list", |b| {
        b.iter(|| {
            let list = List::from_values([Value::from(1.0), Value::from("two")]);
            map.set("items", Value::List(list)).unwrap();
        });
    });

    group.finish();
}

fn bench_list_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage_list_push");
    group.throughput(Throughput::Elements(1));

    let bucket = Bucket::in_memory();
    let tracker = ReferenceTracker::new(bucket.clone());
    let list = List::new();
    tracker.add_reference(&Value::List(list.clone())).unwrap();
    group.bench_function("push", |b| {
        b.iter(|| list.push(black_box(Value::from(1.0))).unwrap());
    });

    group.finish();
}

fn bench_file_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage_file_checkpoint");

    for changes in [1, 10, 100] {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(FileStorage::open(dir.path().join("session.clog"), FsyncPolicy::Never).unwrap());
        let bucket = Bucket::new(storage.clone());
        let (_tracker, map) = tracked_map(&bucket);

        group.throughput(Throughput::Elements(changes as u64));
        group.bench_with_input(BenchmarkId::from_parameter(changes), &changes, |b, &changes| {
            b.iter(|| {
                for i in 0..changes {
                    map.set(&format!("k{}", i % 16), Value::from(i as f64)).unwrap();
                }
                storage.checkpoint().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_reload(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage_reload");
    group.sample_size(20);

    for entries in [10, 100, 1000] {
        let bucket = Bucket::in_memory();
        let ref_id = {
            let (tracker, map) = tracked_map(&bucket);
            for i in 0..entries {
                map.set(&format!("k{}", i), Value::from(i as f64)).unwrap();
            }
            tracker.get_ref_id(&Value::Map(map)).unwrap()
        };

        group.throughput(Throughput::Elements(entries as u64));
        group.bench_with_input(BenchmarkId::from_parameter(entries), &ref_id, |b, &ref_id| {
            b.iter(|| {
                let tracker = ReferenceTracker::new(bucket.clone());
                black_box(tracker.get_value(ref_id, ValueKind::Map, None).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_map_set,
    bench_list_push,
    bench_file_checkpoint,
    bench_reload
);
criterion_main!(benches);
