//! The version chain store: append-only `StateVersion` records per
//! workflow, with a head pointer and an archive tombstone.

use crate::backend::{keys, KvBackend};
use crate::codec;
use crate::error::{Result, StoreError};
use crate::ids::IdAllocator;
use crate::types::{
    AgentId, StateVersion, Timestamp, Version, VersionId, WorkflowId, WorkflowState,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use super::journal::CommitJournal;

/// Persisted head pointer for a workflow.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub(crate) struct HeadRecord {
    pub version: Version,
    pub version_id: VersionId,
    pub updated_at: Timestamp,
}

/// Tombstone summarizing versions moved to cold storage.
///
/// Lets `history()` report the true total count and date range without
/// holding the archived payloads in hot storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveStub {
    pub archived_versions: u64,
    pub first_version: Version,
    pub last_version: Version,
    pub first_timestamp: Timestamp,
    pub last_timestamp: Timestamp,
    /// Cold-storage batch keys covering the archived range.
    pub cold_keys: Vec<String>,
}

/// Result of an append attempt.
#[derive(Debug)]
pub enum AppendOutcome {
    /// The write committed as this version.
    Committed(StateVersion),
    /// The caller's base version is not the current head. The write was
    /// not applied; the conflict detector decides what happens next.
    Mismatch { head: Version },
}

/// A page of a workflow's history, newest first.
#[derive(Clone, Debug)]
pub struct History {
    pub workflow_id: WorkflowId,
    pub head: Version,
    /// Hot versions in this page, newest first.
    pub versions: Vec<StateVersion>,
    /// Summary of archived versions, if any were swept.
    pub archived: Option<ArchiveStub>,
}

impl History {
    /// Total committed versions, including archived ones.
    pub fn total_versions(&self) -> u64 {
        self.head.0
    }

    /// Timestamps of the oldest and newest known versions.
    pub fn date_range(&self) -> Option<(Timestamp, Timestamp)> {
        let newest_archived = self.archived.as_ref().map(|a| a.last_timestamp);
        let newest = self
            .versions
            .first()
            .map(|v| v.timestamp)
            .or(newest_archived);
        let oldest_hot = self.versions.last().map(|v| v.timestamp);
        let oldest = self
            .archived
            .as_ref()
            .map(|a| a.first_timestamp)
            .or(oldest_hot);
        match (oldest, newest) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => None,
        }
    }
}

/// Append-only storage of version chains.
pub struct ChainStore {
    backend: Arc<dyn KvBackend>,
    journal: CommitJournal,
    ids: Arc<IdAllocator>,
    /// Cached head pointers; authoritative copy lives in the backend.
    heads: RwLock<HashMap<WorkflowId, HeadRecord>>,
    /// Per-workflow advisory locks. Appends hold the lock briefly; the
    /// archive sweep holds it for the duration of a compaction.
    locks: Mutex<HashMap<WorkflowId, Arc<Mutex<()>>>>,
}

impl ChainStore {
    /// Open the chain store, running journal recovery and loading heads.
    pub fn open(backend: Arc<dyn KvBackend>, ids: Arc<IdAllocator>) -> Result<Self> {
        let journal = CommitJournal::open(backend.clone())?;

        let mut heads = HashMap::new();
        for key in backend.list_prefix(keys::WORKFLOW_PREFIX)? {
            if let Some(workflow) = keys::workflow_of_head(&key) {
                if let Some(bytes) = backend.get(&key)? {
                    let head: HeadRecord = codec::decode(&bytes)?;
                    heads.insert(workflow, head);
                }
            }
        }

        Ok(Self {
            backend,
            journal,
            ids,
            heads: RwLock::new(heads),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// The advisory lock for a workflow. Shared with the archive manager
    /// so writes during a compaction are delayed, not rejected.
    pub fn workflow_lock(&self, workflow: &WorkflowId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(workflow.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Current head version for a workflow (0 if none exists).
    pub fn head_version(&self, workflow: &WorkflowId) -> Version {
        self.heads
            .read()
            .get(workflow)
            .map(|h| h.version)
            .unwrap_or(Version::INITIAL)
    }

    /// Workflows with at least one committed version.
    pub fn workflows(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<_> = self.heads.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Attempt to append a new version on top of `base_version`.
    ///
    /// Serialization point for writes: the base-version comparison and the
    /// commit happen under the workflow's advisory lock, so no two writes
    /// can commit against the same base. A mismatch is not an error here;
    /// it is routed to the conflict detector by the caller.
    pub fn append(
        &self,
        workflow: &WorkflowId,
        base_version: Version,
        state: WorkflowState,
        author: AgentId,
        description: String,
    ) -> Result<AppendOutcome> {
        let lock = self.workflow_lock(workflow);
        let _guard = lock.lock();

        let current = self.heads.read().get(workflow).copied();
        let head_version = current.map(|h| h.version).unwrap_or(Version::INITIAL);
        if base_version != head_version {
            return Ok(AppendOutcome::Mismatch { head: head_version });
        }

        let version = head_version.next();
        let checksum = codec::digest(&state)?;
        let record = StateVersion {
            id: self.ids.next_version_id()?,
            workflow_id: workflow.clone(),
            version,
            state,
            timestamp: Timestamp::now(),
            author,
            parent_version: current.map(|h| h.version_id),
            change_description: description,
            checksum,
        };

        // Stage, write record, move head, clear. Journal recovery undoes
        // the record write if the head never moves.
        let seq = self.journal.stage(workflow, version)?;
        self.backend
            .put(&keys::version(workflow, version), &codec::encode(&record)?)?;
        let head = HeadRecord {
            version,
            version_id: record.id,
            updated_at: record.timestamp,
        };
        self.backend.put(&keys::head(workflow), &codec::encode(&head)?)?;
        self.journal.clear(seq)?;

        self.heads.write().insert(workflow.clone(), head);
        debug!(workflow = %workflow, version = %version, "version committed");
        Ok(AppendOutcome::Committed(record))
    }

    /// Fetch a specific version, or the head when `version` is `None`.
    ///
    /// The stored checksum is re-verified against a recomputed digest on
    /// every read. A mismatch is reported as corruption, never repaired.
    pub fn get(&self, workflow: &WorkflowId, version: Option<Version>) -> Result<StateVersion> {
        let head = self.head_version(workflow);
        if head == Version::INITIAL {
            return Err(StoreError::WorkflowNotFound(workflow.clone()));
        }
        let version = version.unwrap_or(head);
        if version == Version::INITIAL || version > head {
            return Err(StoreError::VersionNotFound(workflow.clone(), version));
        }

        let bytes = match self.backend.get(&keys::version(workflow, version))? {
            Some(bytes) => bytes,
            None => {
                if let Some(stub) = self.tombstone(workflow)? {
                    if version <= stub.last_version {
                        return Err(StoreError::VersionArchived(workflow.clone(), version));
                    }
                }
                return Err(StoreError::VersionNotFound(workflow.clone(), version));
            }
        };

        let record: StateVersion = codec::decode(&bytes)?;
        let computed = codec::digest(&record.state)?;
        if computed != record.checksum {
            error!(
                workflow = %workflow,
                version = %version,
                stored = %record.checksum,
                computed = %computed,
                "checksum mismatch on read"
            );
            return Err(StoreError::ChecksumMismatch {
                workflow: workflow.clone(),
                version,
                stored: record.checksum,
                computed,
            });
        }
        Ok(record)
    }

    /// A page of history, newest first.
    ///
    /// `before` restarts the scan below a previous page's oldest version;
    /// `limit` bounds the page size. The archived stub rides along so the
    /// caller can always see the full count and date range.
    pub fn history(
        &self,
        workflow: &WorkflowId,
        before: Option<Version>,
        limit: usize,
    ) -> Result<History> {
        let head = self.head_version(workflow);
        if head == Version::INITIAL {
            return Err(StoreError::WorkflowNotFound(workflow.clone()));
        }

        let stub = self.tombstone(workflow)?;
        let min_hot = stub
            .as_ref()
            .map(|s| s.last_version.next())
            .unwrap_or(Version(1));

        let newest = match before {
            Some(b) => match b.prev() {
                Some(p) => p.min(head),
                None => Version::INITIAL,
            },
            None => head,
        };

        let mut versions = Vec::new();
        let mut cursor = newest;
        while cursor >= min_hot && cursor > Version::INITIAL && versions.len() < limit {
            versions.push(self.get(workflow, Some(cursor))?);
            match cursor.prev() {
                Some(prev) => cursor = prev,
                None => break,
            }
        }

        Ok(History {
            workflow_id: workflow.clone(),
            head,
            versions,
            archived: stub,
        })
    }

    /// The archive tombstone, if a sweep has retired versions.
    pub fn tombstone(&self, workflow: &WorkflowId) -> Result<Option<ArchiveStub>> {
        match self.backend.get(&keys::tombstone(workflow))? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Inclusive range of versions still in hot storage, if any.
    pub fn hot_range(&self, workflow: &WorkflowId) -> Result<Option<(Version, Version)>> {
        let head = self.head_version(workflow);
        if head == Version::INITIAL {
            return Ok(None);
        }
        let min_hot = self
            .tombstone(workflow)?
            .map(|s| s.last_version.next())
            .unwrap_or(Version(1));
        if min_hot > head {
            return Ok(None);
        }
        Ok(Some((min_hot, head)))
    }

    /// Read a contiguous ascending range of hot versions.
    pub fn read_range(
        &self,
        workflow: &WorkflowId,
        first: Version,
        last: Version,
    ) -> Result<Vec<StateVersion>> {
        let mut out = Vec::new();
        let mut cursor = first;
        while cursor <= last {
            out.push(self.get(workflow, Some(cursor))?);
            cursor = cursor.next();
        }
        Ok(out)
    }

    /// Retire a contiguous prefix of hot versions after they have been
    /// copied to cold storage. Deletes the hot records and extends the
    /// tombstone. The head version is never eligible.
    ///
    /// Caller must hold the workflow's advisory lock.
    pub fn retire_versions(
        &self,
        workflow: &WorkflowId,
        records: &[StateVersion],
        cold_key: Option<String>,
    ) -> Result<ArchiveStub> {
        let (first, last) = match (records.first(), records.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                return Err(StoreError::InvalidOperation(
                    "empty retire range".into(),
                ))
            }
        };
        if last.version >= self.head_version(workflow) {
            return Err(StoreError::InvalidOperation(
                "cannot retire the head version".into(),
            ));
        }

        let mut stub = self.tombstone(workflow)?.unwrap_or(ArchiveStub {
            archived_versions: 0,
            first_version: first.version,
            last_version: last.version,
            first_timestamp: first.timestamp,
            last_timestamp: last.timestamp,
            cold_keys: Vec::new(),
        });
        if stub.archived_versions > 0 && first.version != stub.last_version.next() {
            return Err(StoreError::InvalidOperation(format!(
                "retire range must start at {}, got {}",
                stub.last_version.next(),
                first.version
            )));
        }

        stub.archived_versions += records.len() as u64;
        stub.last_version = last.version;
        stub.last_timestamp = last.timestamp;
        if let Some(key) = cold_key {
            stub.cold_keys.push(key);
        }

        // Tombstone first: if we crash mid-delete, leftover hot records
        // below the tombstone are unreachable garbage, not corruption.
        self.backend
            .put(&keys::tombstone(workflow), &codec::encode(&stub)?)?;
        for record in records {
            self.backend
                .delete(&keys::version(workflow, record.version))?;
        }
        Ok(stub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::schema::default_schema_ref;
    use serde_json::json;

    fn chain() -> ChainStore {
        let backend = Arc::new(MemoryBackend::new());
        let ids = Arc::new(IdAllocator::open(backend.clone()).unwrap());
        ChainStore::open(backend, ids).unwrap()
    }

    fn state(status: &str) -> WorkflowState {
        WorkflowState::new(default_schema_ref()).with_field("status", json!(status))
    }

    fn commit(chain: &ChainStore, wf: &WorkflowId, base: u64, status: &str) -> StateVersion {
        match chain
            .append(
                wf,
                Version(base),
                state(status),
                AgentId::new("tester"),
                format!("set status {status}"),
            )
            .unwrap()
        {
            AppendOutcome::Committed(v) => v,
            AppendOutcome::Mismatch { head } => panic!("unexpected mismatch, head {head}"),
        }
    }

    #[test]
    fn test_first_append_is_version_one() {
        let chain = chain();
        let wf = WorkflowId::new("wf-1");
        let v = commit(&chain, &wf, 0, "running");
        assert_eq!(v.version, Version(1));
        assert_eq!(v.parent_version, None);
        assert_eq!(chain.head_version(&wf), Version(1));
    }

    #[test]
    fn test_parent_links_form_chain() {
        let chain = chain();
        let wf = WorkflowId::new("wf-1");
        let v1 = commit(&chain, &wf, 0, "running");
        let v2 = commit(&chain, &wf, 1, "paused");
        assert_eq!(v2.parent_version, Some(v1.id));
        assert_eq!(v2.version, Version(2));
    }

    #[test]
    fn test_stale_base_reports_mismatch() {
        let chain = chain();
        let wf = WorkflowId::new("wf-1");
        commit(&chain, &wf, 0, "running");
        commit(&chain, &wf, 1, "paused");

        let outcome = chain
            .append(
                &wf,
                Version(1),
                state("resumed"),
                AgentId::new("late-writer"),
                "stale write".into(),
            )
            .unwrap();
        match outcome {
            AppendOutcome::Mismatch { head } => assert_eq!(head, Version(2)),
            AppendOutcome::Committed(_) => panic!("stale write must not commit"),
        }
        // Nothing was applied.
        assert_eq!(chain.head_version(&wf), Version(2));
    }

    #[test]
    fn test_get_head_and_historical() {
        let chain = chain();
        let wf = WorkflowId::new("wf-1");
        commit(&chain, &wf, 0, "running");
        commit(&chain, &wf, 1, "paused");

        let head = chain.get(&wf, None).unwrap();
        assert_eq!(head.version, Version(2));
        let old = chain.get(&wf, Some(Version(1))).unwrap();
        assert_eq!(old.state.get("status"), Some(&json!("running")));
    }

    #[test]
    fn test_missing_workflow_and_version() {
        let chain = chain();
        let wf = WorkflowId::new("missing");
        assert!(matches!(
            chain.get(&wf, None).unwrap_err(),
            StoreError::WorkflowNotFound(_)
        ));

        commit(&chain, &wf, 0, "running");
        assert!(matches!(
            chain.get(&wf, Some(Version(7))).unwrap_err(),
            StoreError::VersionNotFound(_, _)
        ));
    }

    #[test]
    fn test_history_newest_first_and_restartable() {
        let chain = chain();
        let wf = WorkflowId::new("wf-1");
        for i in 0..5 {
            commit(&chain, &wf, i, &format!("step-{}", i + 1));
        }

        let page = chain.history(&wf, None, 2).unwrap();
        assert_eq!(page.head, Version(5));
        let versions: Vec<u64> = page.versions.iter().map(|v| v.version.0).collect();
        assert_eq!(versions, vec![5, 4]);

        let next = chain.history(&wf, Some(Version(4)), 10).unwrap();
        let versions: Vec<u64> = next.versions.iter().map(|v| v.version.0).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!(next.total_versions(), 5);
    }

    #[test]
    fn test_date_range_on_fully_archived_page() {
        // A page below the retained range holds no hot versions; the
        // range must span the archived stub, not collapse to its
        // oldest timestamp.
        let history = History {
            workflow_id: WorkflowId::new("wf-1"),
            head: Version(6),
            versions: Vec::new(),
            archived: Some(ArchiveStub {
                archived_versions: 4,
                first_version: Version(1),
                last_version: Version(4),
                first_timestamp: Timestamp(1_000),
                last_timestamp: Timestamp(4_000),
                cold_keys: vec!["archive/wf-1/00000000000000000001-00000000000000000004".into()],
            }),
        };
        assert_eq!(
            history.date_range(),
            Some((Timestamp(1_000), Timestamp(4_000)))
        );
    }

    #[test]
    fn test_retire_versions_leaves_tombstone() {
        let chain = chain();
        let wf = WorkflowId::new("wf-1");
        for i in 0..5 {
            commit(&chain, &wf, i, &format!("step-{}", i + 1));
        }

        let records = chain.read_range(&wf, Version(1), Version(3)).unwrap();
        let stub = chain
            .retire_versions(&wf, &records, Some("batch-1".into()))
            .unwrap();
        assert_eq!(stub.archived_versions, 3);
        assert_eq!(stub.last_version, Version(3));

        // Retired versions are gone from hot storage but history still
        // reports the full count.
        assert!(matches!(
            chain.get(&wf, Some(Version(2))).unwrap_err(),
            StoreError::VersionArchived(_, _)
        ));
        let page = chain.history(&wf, None, 100).unwrap();
        assert_eq!(page.versions.len(), 2);
        assert_eq!(page.total_versions(), 5);
        assert_eq!(page.archived.unwrap().archived_versions, 3);
    }

    #[test]
    fn test_retire_refuses_head() {
        let chain = chain();
        let wf = WorkflowId::new("wf-1");
        commit(&chain, &wf, 0, "only");
        let records = chain.read_range(&wf, Version(1), Version(1)).unwrap();
        assert!(chain.retire_versions(&wf, &records, None).is_err());
    }

    #[test]
    fn test_heads_survive_reopen() {
        let backend = Arc::new(MemoryBackend::new());
        let wf = WorkflowId::new("wf-1");
        {
            let ids = Arc::new(IdAllocator::open(backend.clone()).unwrap());
            let chain = ChainStore::open(backend.clone(), ids).unwrap();
            commit(&chain, &wf, 0, "running");
            commit(&chain, &wf, 1, "done");
        }
        let ids = Arc::new(IdAllocator::open(backend.clone()).unwrap());
        let chain = ChainStore::open(backend, ids).unwrap();
        assert_eq!(chain.head_version(&wf), Version(2));
        assert_eq!(chain.get(&wf, None).unwrap().state.get("status"), Some(&json!("done")));
    }
}
