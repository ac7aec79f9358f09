//! Key-value backend abstraction.
//!
//! The chain store, snapshot manager, and conflict queue all persist
//! through this trait. Implementations must provide read-after-write
//! consistency per key. Implementations that talk to a remote store
//! surface `StoreError::StorageTimeout` when an operation does not
//! acknowledge in time; retrying a timed-out `put` with the same key and
//! bytes is always safe.

use crate::error::Result;

/// Minimal key-value contract required by the store.
pub trait KvBackend: Send + Sync {
    /// Store bytes under a key, replacing any previous value.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch the bytes stored under a key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove a key. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, lexicographically sorted.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Storage key layout.
///
/// One logical record per `(workflow, version)`, a head pointer per
/// workflow, a snapshot index per workflow, and a tombstone per workflow
/// once versions have been archived. Version numbers are zero-padded so
/// lexicographic key order matches numeric order.
pub mod keys {
    use crate::types::{SnapshotId, Version, WorkflowId};

    pub fn version(workflow: &WorkflowId, version: Version) -> String {
        format!("wf/{}/v/{:020}", workflow, version.0)
    }

    pub fn version_prefix(workflow: &WorkflowId) -> String {
        format!("wf/{}/v/", workflow)
    }

    pub fn head(workflow: &WorkflowId) -> String {
        format!("wf/{}/head", workflow)
    }

    pub fn snapshot(workflow: &WorkflowId, id: SnapshotId) -> String {
        format!("wf/{}/snap/{:020}", workflow, id.0)
    }

    pub fn snapshot_prefix(workflow: &WorkflowId) -> String {
        format!("wf/{}/snap/", workflow)
    }

    pub fn tombstone(workflow: &WorkflowId) -> String {
        format!("wf/{}/tomb", workflow)
    }

    pub fn conflict(id: crate::types::ConflictId) -> String {
        format!("conflict/{:020}", id.0)
    }

    pub const CONFLICT_PREFIX: &str = "conflict/";

    pub fn journal(seq: u64) -> String {
        format!("journal/{:020}", seq)
    }

    pub const JOURNAL_PREFIX: &str = "journal/";

    pub const IDS: &str = "meta/ids";

    pub const WORKFLOW_PREFIX: &str = "wf/";

    /// Extract the workflow id from a head key.
    pub fn workflow_of_head(key: &str) -> Option<WorkflowId> {
        let rest = key.strip_prefix(WORKFLOW_PREFIX)?;
        let id = rest.strip_suffix("/head")?;
        if id.contains('/') {
            return None;
        }
        Some(WorkflowId::new(id))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_version_keys_sort_numerically() {
            let wf = WorkflowId::new("wf-1");
            let a = version(&wf, Version(9));
            let b = version(&wf, Version(10));
            assert!(a < b);
        }

        #[test]
        fn test_workflow_of_head() {
            let wf = WorkflowId::new("wf-1");
            assert_eq!(workflow_of_head(&head(&wf)), Some(wf.clone()));
            assert_eq!(workflow_of_head(&version(&wf, Version(1))), None);
            assert_eq!(workflow_of_head(&tombstone(&wf)), None);
        }
    }
}
