//! Snapshot management and the archive sweep.

use super::cold::ColdStore;
use crate::backend::{keys, KvBackend};
use crate::chain::ChainStore;
use crate::codec;
use crate::error::{Result, StoreError};
use crate::ids::IdAllocator;
use crate::types::{
    ArchivePolicy, SnapshotId, StateSnapshot, StateVersion, Timestamp, Version, WorkflowId,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info};

/// A batch of versions moved to cold storage.
#[derive(Serialize, Deserialize)]
struct ArchiveBatch {
    workflow_id: WorkflowId,
    first_version: Version,
    last_version: Version,
    versions: Vec<StateVersion>,
}

/// Outcome of one archive sweep.
#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    pub workflows_examined: usize,
    pub workflows_swept: usize,
    pub versions_archived: u64,
    pub batches_written: usize,
}

/// Creates snapshots and retires old versions to cold storage.
pub struct ArchiveManager {
    backend: Arc<dyn KvBackend>,
    chain: Arc<ChainStore>,
    cold: Arc<dyn ColdStore>,
    ids: Arc<IdAllocator>,
    default_policy: ArchivePolicy,
    overrides: RwLock<HashMap<WorkflowId, ArchivePolicy>>,
}

impl ArchiveManager {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        chain: Arc<ChainStore>,
        cold: Arc<dyn ColdStore>,
        ids: Arc<IdAllocator>,
        default_policy: ArchivePolicy,
    ) -> Self {
        Self {
            backend,
            chain,
            cold,
            ids,
            default_policy,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Override the retention policy for one workflow.
    pub fn set_policy(&self, workflow: &WorkflowId, policy: ArchivePolicy) {
        self.overrides.write().insert(workflow.clone(), policy);
    }

    /// Effective policy for a workflow.
    pub fn policy_for(&self, workflow: &WorkflowId) -> ArchivePolicy {
        self.overrides
            .read()
            .get(workflow)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    // --- Snapshots ---

    /// Capture the current head state as a snapshot, synchronously.
    pub fn create_snapshot(
        &self,
        workflow: &WorkflowId,
        description: String,
    ) -> Result<StateSnapshot> {
        let head = self.chain.get(workflow, None)?;
        let canonical = codec::canonical_bytes(&head.state)?;
        let snapshot = StateSnapshot {
            id: self.ids.next_snapshot_id()?,
            workflow_id: workflow.clone(),
            state: head.state,
            version: head.version,
            created_at: Timestamp::now(),
            description,
            size: canonical.len() as u64,
            checksum: head.checksum,
        };
        self.backend.put(
            &keys::snapshot(workflow, snapshot.id),
            &codec::encode(&snapshot)?,
        )?;
        debug!(workflow = %workflow, snapshot = %snapshot.id, version = %snapshot.version, "snapshot created");
        Ok(snapshot)
    }

    /// Load a snapshot, verifying its checksum.
    pub fn get_snapshot(&self, workflow: &WorkflowId, id: SnapshotId) -> Result<StateSnapshot> {
        let bytes = self
            .backend
            .get(&keys::snapshot(workflow, id))?
            .ok_or(StoreError::SnapshotNotFound(id))?;
        let snapshot: StateSnapshot = codec::decode(&bytes)?;
        let computed = codec::digest(&snapshot.state)?;
        if computed != snapshot.checksum {
            return Err(StoreError::Corruption(format!(
                "snapshot {id} checksum mismatch: stored {}, computed {computed}",
                snapshot.checksum
            )));
        }
        Ok(snapshot)
    }

    /// Snapshots of a workflow, oldest first.
    pub fn list_snapshots(&self, workflow: &WorkflowId) -> Result<Vec<StateSnapshot>> {
        let mut snapshots = Vec::new();
        for key in self.backend.list_prefix(&keys::snapshot_prefix(workflow))? {
            if let Some(bytes) = self.backend.get(&key)? {
                snapshots.push(codec::decode(&bytes)?);
            }
        }
        Ok(snapshots)
    }

    /// Explicit snapshot cleanup.
    pub fn delete_snapshot(&self, workflow: &WorkflowId, id: SnapshotId) -> Result<()> {
        if !self.backend.delete(&keys::snapshot(workflow, id))? {
            return Err(StoreError::SnapshotNotFound(id));
        }
        Ok(())
    }

    // --- Archive sweep ---

    /// Run one sweep over every workflow.
    ///
    /// A workflow is compacted when its hot version count exceeds the
    /// policy's maximum or its oldest hot version exceeds the age bound.
    /// The head version is never retired. Holds the workflow's advisory
    /// lock only while copying and deleting that workflow's versions.
    pub fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = Timestamp::now();

        for workflow in self.chain.workflows() {
            report.workflows_examined += 1;
            let policy = self.policy_for(&workflow);
            if !policy.cold_storage_enabled {
                continue;
            }

            let lock = self.chain.workflow_lock(&workflow);
            let _guard = lock.lock();

            let Some((first, last)) = self.chain.hot_range(&workflow)? else {
                continue;
            };
            let hot_count = last.0 - first.0 + 1;
            // All but the head are candidates.
            let retirable = hot_count.saturating_sub(1);
            if retirable == 0 {
                continue;
            }

            let excess_by_count = hot_count.saturating_sub(policy.max_versions_per_workflow);
            let excess_by_age = self.count_aged(&workflow, first, retirable, &policy, now)?;
            let take = excess_by_count.max(excess_by_age).min(retirable);
            if take == 0 {
                continue;
            }

            let through = Version(first.0 + take - 1);
            let records = self.chain.read_range(&workflow, first, through)?;
            let cold_key = self.write_batch(&workflow, &records, &policy)?;
            self.chain.retire_versions(&workflow, &records, Some(cold_key.clone()))?;

            info!(
                workflow = %workflow,
                first = %first,
                through = %through,
                batch = %cold_key,
                "archived versions to cold storage"
            );
            report.workflows_swept += 1;
            report.versions_archived += take;
            report.batches_written += 1;
        }

        Ok(report)
    }

    fn count_aged(
        &self,
        workflow: &WorkflowId,
        first: Version,
        retirable: u64,
        policy: &ArchivePolicy,
        now: Timestamp,
    ) -> Result<u64> {
        let mut aged = 0u64;
        let mut cursor = first;
        while aged < retirable {
            let record = self.chain.get(workflow, Some(cursor))?;
            if record.timestamp.age_days(now) < policy.archive_after_days {
                break;
            }
            aged += 1;
            cursor = cursor.next();
        }
        Ok(aged)
    }

    fn write_batch(
        &self,
        workflow: &WorkflowId,
        records: &[StateVersion],
        policy: &ArchivePolicy,
    ) -> Result<String> {
        let first = records.first().map(|r| r.version).unwrap_or(Version(0));
        let last = records.last().map(|r| r.version).unwrap_or(Version(0));
        let batch = ArchiveBatch {
            workflow_id: workflow.clone(),
            first_version: first,
            last_version: last,
            versions: records.to_vec(),
        };
        let encoded = codec::encode(&batch)?;

        let (bytes, suffix) = if policy.compression_enabled {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&encoded)?;
            (encoder.finish()?, ".gz")
        } else {
            (encoded, "")
        };

        let key = format!("archive/{}/{:020}-{:020}{}", workflow, first.0, last.0, suffix);
        self.cold.put_batch(&key, &bytes)?;
        Ok(key)
    }

    /// Best-effort lookup of an archived version in cold storage.
    pub fn fetch_archived(
        &self,
        workflow: &WorkflowId,
        version: Version,
    ) -> Result<StateVersion> {
        let stub = self
            .chain
            .tombstone(workflow)?
            .ok_or_else(|| StoreError::VersionNotFound(workflow.clone(), version))?;

        for key in &stub.cold_keys {
            let Some((first, last)) = parse_batch_range(key) else {
                continue;
            };
            if version < first || version > last {
                continue;
            }
            let Some(bytes) = self.cold.get_batch(key)? else {
                continue;
            };
            let encoded = if key.ends_with(".gz") {
                let mut decoder = GzDecoder::new(&bytes[..]);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                out
            } else {
                bytes
            };
            let batch: ArchiveBatch = codec::decode(&encoded)?;
            if let Some(record) = batch.versions.into_iter().find(|v| v.version == version) {
                let computed = codec::digest(&record.state)?;
                if computed != record.checksum {
                    return Err(StoreError::ChecksumMismatch {
                        workflow: workflow.clone(),
                        version,
                        stored: record.checksum,
                        computed,
                    });
                }
                return Ok(record);
            }
        }
        Err(StoreError::VersionNotFound(workflow.clone(), version))
    }
}

/// Parse `archive/{wf}/{first}-{last}[.gz]` into its version range.
fn parse_batch_range(key: &str) -> Option<(Version, Version)> {
    let range = key.rsplit('/').next()?;
    let range = range.strip_suffix(".gz").unwrap_or(range);
    let (first, last) = range.split_once('-')?;
    Some((
        Version(first.parse().ok()?),
        Version(last.parse().ok()?),
    ))
}
