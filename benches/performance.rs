//! Performance benchmarks for the workflow state store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use statevault::{
    default_schema_ref, AgentId, StateStore, StoreConfig, Version, WorkflowId, WorkflowState,
};
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> StateStore {
    StateStore::open(StoreConfig {
        start_background: false,
        backend_cache_size: 1000,
        ..StoreConfig::at_path(dir.path().join("vault"))
    })
    .unwrap()
}

fn sample_state(step: u64, fields: usize) -> WorkflowState {
    let mut state = WorkflowState::new(default_schema_ref())
        .with_field("status", json!("running"))
        .with_field("step", json!(step));
    for i in 0..fields {
        state = state.with_field(format!("field_{i}"), json!({"value": i, "step": step}));
    }
    state
}

/// Benchmark write throughput with varying state sizes
fn bench_persist_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("persist_state");

    for field_count in [4, 32, 128] {
        group.bench_with_input(
            BenchmarkId::new("fields", field_count),
            &field_count,
            |b, &fields| {
                let dir = TempDir::new().unwrap();
                let store = create_store(&dir);
                let wf = WorkflowId::new("bench");
                let author = AgentId::new("bencher");
                let mut version = 0u64;

                b.iter(|| {
                    let committed = store
                        .persist_state(
                            &wf,
                            Version(version),
                            sample_state(version + 1, fields),
                            author.clone(),
                            "bench write",
                        )
                        .unwrap();
                    version = committed.version.0;
                    black_box(committed);
                });
            },
        );
    }

    group.finish();
}

/// Benchmark head reads served from the active state cache
fn bench_cached_read(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let wf = WorkflowId::new("bench");
    store
        .persist_state(
            &wf,
            Version(0),
            sample_state(1, 32),
            AgentId::new("bencher"),
            "seed",
        )
        .unwrap();

    c.bench_function("get_state_cached", |b| {
        b.iter(|| {
            black_box(store.get_state(&wf).unwrap());
        });
    });
}

/// Benchmark history pagination over chains of varying depth
fn bench_history_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("history_scan");

    for depth in [10, 100, 500] {
        group.bench_with_input(BenchmarkId::new("chain_depth", depth), &depth, |b, &depth| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir);
            let wf = WorkflowId::new("bench");
            for i in 0..depth {
                store
                    .persist_state(
                        &wf,
                        Version(i),
                        sample_state(i + 1, 8),
                        AgentId::new("bencher"),
                        "step",
                    )
                    .unwrap();
            }

            b.iter(|| {
                black_box(store.history(&wf, None, 50).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark the conflict auto-merge path: every write is stale
fn bench_auto_merge(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let wf = WorkflowId::new("bench");
    store
        .persist_state(
            &wf,
            Version(0),
            sample_state(1, 8),
            AgentId::new("seed"),
            "seed",
        )
        .unwrap();

    c.bench_function("persist_with_auto_merge", |b| {
        let author = AgentId::new("stale-writer");
        let mut n = 0u64;
        b.iter(|| {
            // Base version 1 is always behind; a fresh field name keeps
            // every stale write disjoint, forcing the merge path.
            n += 1;
            let state = sample_state(1, 8).with_field(format!("probe_{n}"), json!(n));
            black_box(
                store
                    .persist_state(&wf, Version(1), state, author.clone(), "stale")
                    .unwrap(),
            );
        });
    });
}

criterion_group!(
    benches,
    bench_persist_state,
    bench_cached_read,
    bench_history_scan,
    bench_auto_merge
);
criterion_main!(benches);
