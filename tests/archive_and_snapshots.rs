//! Snapshot restore and archive sweep behavior through the store facade.

use serde_json::json;
use statevault::{
    default_schema_ref, AgentId, ArchivePolicy, StateStore, StoreConfig, StoreError, Version,
    WorkflowId, WorkflowState,
};
use tempfile::TempDir;

fn store_with_policy(policy: ArchivePolicy) -> StateStore {
    StateStore::open(StoreConfig {
        archive_policy: policy,
        ..StoreConfig::in_memory()
    })
    .unwrap()
}

fn state(pairs: &[(&str, serde_json::Value)]) -> WorkflowState {
    let mut s = WorkflowState::new(default_schema_ref());
    for (k, v) in pairs {
        s = s.with_field(*k, v.clone());
    }
    s
}

fn commit_steps(store: &StateStore, wf: &WorkflowId, count: u64) {
    for i in 0..count {
        store
            .persist_state(
                wf,
                Version(i),
                state(&[("step", json!(i + 1))]),
                AgentId::new("runner"),
                format!("step {}", i + 1),
            )
            .unwrap();
    }
}

// --- Snapshots ---

#[test]
fn test_snapshot_restore_round_trip() {
    let store = store_with_policy(ArchivePolicy::default());
    let wf = WorkflowId::new("wf-1");

    store
        .persist_state(
            &wf,
            Version(0),
            state(&[("config", json!({"replicas": 3})), ("status", json!("stable"))]),
            AgentId::new("a"),
            "good config",
        )
        .unwrap();
    let snapshot = store.create_snapshot(&wf, "known good").unwrap();
    assert_eq!(snapshot.version, Version(1));
    assert!(snapshot.size > 0);

    // Things go downhill across two more versions.
    store
        .persist_state(
            &wf,
            Version(1),
            state(&[("config", json!({"replicas": 30})), ("status", json!("degraded"))]),
            AgentId::new("a"),
            "scale up",
        )
        .unwrap();
    store
        .persist_state(
            &wf,
            Version(2),
            state(&[("config", json!({"replicas": 30})), ("status", json!("failing"))]),
            AgentId::new("a"),
            "alarms firing",
        )
        .unwrap();

    let restored = store
        .restore_snapshot(&wf, snapshot.id, AgentId::new("operator"))
        .unwrap();

    // Restore extends the chain, it never rewrites it.
    assert_eq!(restored.version, Version(4));
    let (head, _) = store.get_state(&wf).unwrap();
    assert_eq!(head.get("config"), Some(&json!({"replicas": 3})));
    assert_eq!(head.get("status"), Some(&json!("stable")));
    let page = store.history(&wf, None, 10).unwrap();
    assert_eq!(page.versions.len(), 4);
    assert_eq!(
        page.versions[1].state.get("status"),
        Some(&json!("failing"))
    );
}

#[test]
fn test_snapshot_listing_and_deletion() {
    let store = store_with_policy(ArchivePolicy::default());
    let wf = WorkflowId::new("wf-1");
    commit_steps(&store, &wf, 2);

    let first = store.create_snapshot(&wf, "after step 2").unwrap();
    commit_steps_from(&store, &wf, 2, 1);
    let second = store.create_snapshot(&wf, "after step 3").unwrap();

    let listed = store.list_snapshots(&wf).unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first.id);
    assert_eq!(listed[1].id, second.id);

    store.delete_snapshot(&wf, first.id).unwrap();
    assert_eq!(store.list_snapshots(&wf).unwrap().len(), 1);
    assert!(matches!(
        store.get_snapshot(&wf, first.id).unwrap_err(),
        StoreError::SnapshotNotFound(_)
    ));
}

fn commit_steps_from(store: &StateStore, wf: &WorkflowId, base: u64, count: u64) {
    for i in 0..count {
        store
            .persist_state(
                wf,
                Version(base + i),
                state(&[("step", json!(base + i + 1))]),
                AgentId::new("runner"),
                format!("step {}", base + i + 1),
            )
            .unwrap();
    }
}

#[test]
fn test_restore_missing_snapshot() {
    let store = store_with_policy(ArchivePolicy::default());
    let wf = WorkflowId::new("wf-1");
    commit_steps(&store, &wf, 1);

    let err = store
        .restore_snapshot(&wf, statevault::SnapshotId(99), AgentId::new("op"))
        .unwrap_err();
    assert!(matches!(err, StoreError::SnapshotNotFound(_)));
}

// --- Archival ---

#[test]
fn test_archive_sweep_is_non_destructive() {
    let store = store_with_policy(ArchivePolicy {
        max_versions_per_workflow: 3,
        archive_after_days: 10_000,
        ..Default::default()
    });
    let wf = WorkflowId::new("wf-1");
    commit_steps(&store, &wf, 10);

    let report = store.archive_old_versions().unwrap();
    assert_eq!(report.workflows_swept, 1);
    assert_eq!(report.versions_archived, 7);

    // Hot reads of archived versions say archived, not missing.
    assert!(matches!(
        store.get_version(&wf, Version(4)).unwrap_err(),
        StoreError::VersionArchived(_, _)
    ));

    // History still reports the full chain with its date range.
    let page = store.history(&wf, None, 100).unwrap();
    assert_eq!(page.total_versions(), 10);
    assert_eq!(page.versions.len(), 3);
    let (oldest, newest) = page.date_range().unwrap();
    assert!(oldest <= newest);
    let stub = page.archived.unwrap();
    assert_eq!(stub.first_version, Version(1));
    assert_eq!(stub.last_version, Version(7));

    // The archived content itself is retrievable from cold storage.
    let cold = store.get_archived_version(&wf, Version(4)).unwrap();
    assert_eq!(cold.state.get("step"), Some(&json!(4)));
    assert_eq!(store.metrics().versions_archived, 7);
}

#[test]
fn test_sweep_never_touches_small_workflows() {
    let store = store_with_policy(ArchivePolicy {
        max_versions_per_workflow: 100,
        archive_after_days: 10_000,
        ..Default::default()
    });
    let wf = WorkflowId::new("small");
    commit_steps(&store, &wf, 5);

    let report = store.archive_old_versions().unwrap();
    assert_eq!(report.workflows_swept, 0);
    assert_eq!(store.history(&wf, None, 100).unwrap().versions.len(), 5);
}

#[test]
fn test_per_workflow_policy_override() {
    let store = store_with_policy(ArchivePolicy {
        max_versions_per_workflow: 100,
        archive_after_days: 10_000,
        ..Default::default()
    });
    let keep = WorkflowId::new("keep");
    let trim = WorkflowId::new("trim");
    commit_steps(&store, &keep, 6);
    commit_steps(&store, &trim, 6);

    store.set_archive_policy(
        &trim,
        ArchivePolicy {
            max_versions_per_workflow: 2,
            archive_after_days: 10_000,
            ..Default::default()
        },
    );
    store.archive_old_versions().unwrap();

    assert_eq!(store.history(&keep, None, 100).unwrap().versions.len(), 6);
    assert_eq!(store.history(&trim, None, 100).unwrap().versions.len(), 2);
}

#[test]
fn test_writes_continue_after_sweep() {
    let store = store_with_policy(ArchivePolicy {
        max_versions_per_workflow: 2,
        archive_after_days: 10_000,
        ..Default::default()
    });
    let wf = WorkflowId::new("wf-1");
    commit_steps(&store, &wf, 5);
    store.archive_old_versions().unwrap();

    // The chain keeps extending from the surviving head.
    commit_steps_from(&store, &wf, 5, 2);
    let (head, version) = store.get_state(&wf).unwrap();
    assert_eq!(version, Version(7));
    assert_eq!(head.get("step"), Some(&json!(7)));
    assert_eq!(store.history(&wf, None, 100).unwrap().total_versions(), 7);
}

#[test]
fn test_archived_batches_survive_restart() {
    let dir = TempDir::new().unwrap();
    let wf = WorkflowId::new("wf-1");
    let config = || StoreConfig {
        archive_policy: ArchivePolicy {
            max_versions_per_workflow: 2,
            archive_after_days: 10_000,
            ..Default::default()
        },
        start_background: false,
        ..StoreConfig::at_path(dir.path().join("vault"))
    };

    {
        let store = StateStore::open(config()).unwrap();
        commit_steps(&store, &wf, 6);
        store.archive_old_versions().unwrap();
    }

    let store = StateStore::open(config()).unwrap();
    let cold = store.get_archived_version(&wf, Version(2)).unwrap();
    assert_eq!(cold.state.get("step"), Some(&json!(2)));
    assert_eq!(store.history(&wf, None, 100).unwrap().total_versions(), 6);
}
