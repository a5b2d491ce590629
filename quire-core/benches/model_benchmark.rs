use criterion::{criterion_group, criterion_main, Criterion};
use quire_core::{DocumentModel, Origin};
use std::hint::black_box;

fn bench_local_insert(c: &mut Criterion) {
    c.bench_function("local_insert_append", |b| {
        let mut model = DocumentModel::with_replica_id(1);
        b.iter(|| {
            black_box(model.push(black_box("x")));
        })
    });
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut author = DocumentModel::with_replica_id(1);
    let deltas: Vec<Vec<u8>> = (0..1000)
        .filter_map(|i| author.push(&format!("w{i} ")).map(|c| c.delta))
        .collect();

    c.bench_function("apply_1k_remote_deltas", |b| {
        b.iter(|| {
            let mut replica = DocumentModel::with_replica_id(2);
            for d in &deltas {
                let _ = replica.apply_delta(black_box(d), Origin::Remote);
            }
            black_box(replica.len());
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut author = DocumentModel::with_replica_id(1);
    for i in 0..1000 {
        author.push(&format!("w{i} "));
    }
    let snapshot = author.encode_full_state();

    c.bench_function("encode_full_state_1k_edits", |b| {
        b.iter(|| black_box(author.encode_full_state()))
    });

    c.bench_function("apply_snapshot_1k_edits", |b| {
        b.iter(|| {
            let mut replica = DocumentModel::with_replica_id(2);
            let _ = replica.apply_snapshot(black_box(&snapshot));
            black_box(replica.len());
        })
    });
}

fn bench_reapply_idempotent(c: &mut Criterion) {
    let mut author = DocumentModel::with_replica_id(1);
    let delta = author.push("hello world").map(|c| c.delta).unwrap_or_default();
    let mut replica = DocumentModel::with_replica_id(2);
    let _ = replica.apply_delta(&delta, Origin::Remote);

    c.bench_function("reapply_known_delta", |b| {
        b.iter(|| black_box(replica.apply_delta(black_box(&delta), Origin::Remote)))
    });
}

criterion_group!(
    benches,
    bench_local_insert,
    bench_apply_remote,
    bench_snapshot,
    bench_reapply_idempotent,
);
criterion_main!(benches);
