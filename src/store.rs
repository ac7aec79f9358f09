//! The store facade: wires the chain, cache, conflict queue, notifier,
//! and archive together behind one handle.

use crate::archive::{
    ArchiveManager, ArchiveRunner, ColdStore, FileColdStore, MemoryColdStore, SweepReport,
};
use crate::backend::{FileBackend, KvBackend, MemoryBackend};
use crate::cache::ActiveStateCache;
use crate::chain::{AppendOutcome, ChainStore, History};
use crate::conflict::{merge_states, ConflictQueue, MergeOutcome};
use crate::error::{Result, StoreError};
use crate::ids::IdAllocator;
use crate::schema::{SchemaRegistry, StateSchema};
use crate::subscriptions::{DeliveryHandle, Notifier, NotifierConfig, SubscriptionRegistry};
use crate::types::{
    AgentId, ArchivePolicy, ChangeKind, CompetingWrite, ConflictId, ResolutionStrategy,
    SnapshotId, StateChange, StateConflict, StateSnapshot, StateVersion, StoreStats, Timestamp,
    Version, WorkflowId, WorkflowState,
};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Writes retried after an auto-merge before the conflict escalates.
const MAX_WRITE_ATTEMPTS: u32 = 3;

const LOCK_FILE: &str = "statevault.lock";

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory for file-backed storage; `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// Entries held by the active state cache.
    pub cache_capacity: usize,
    /// Idle TTL for cached states.
    pub cache_ttl: Duration,
    /// Sealed-record read cache of the file backend.
    pub backend_cache_size: usize,
    /// Per-subscriber notification buffer.
    pub subscriber_buffer: usize,
    pub notifier: NotifierConfig,
    pub archive_policy: ArchivePolicy,
    /// Interval between background archive sweeps.
    pub sweep_interval: Duration,
    /// Whether to run the archive sweep on a background thread.
    pub start_background: bool,
    /// Overall bound on a write, covering conflict detection and
    /// auto-merge retries. Exceeding it returns `StorageTimeout`.
    pub write_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            cache_capacity: 1024,
            cache_ttl: Duration::from_secs(300),
            backend_cache_size: 256,
            subscriber_buffer: 64,
            notifier: NotifierConfig::default(),
            archive_policy: ArchivePolicy::default(),
            sweep_interval: Duration::from_secs(60),
            start_background: true,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    /// In-memory store with the background sweeper disabled.
    pub fn in_memory() -> Self {
        Self {
            start_background: false,
            ..Default::default()
        }
    }

    /// File-backed store rooted at `path`.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct Metrics {
    writes_committed: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_auto_resolved: AtomicU64,
    conflicts_escalated: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    versions_archived: AtomicU64,
    snapshots_created: AtomicU64,
}

impl Metrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Versioned workflow state store.
///
/// Thread-safe; methods take `&self` and may be called concurrently.
/// Dropping the store stops the notifier and archive threads.
pub struct StateStore {
    chain: Arc<ChainStore>,
    cache: Arc<ActiveStateCache>,
    conflicts: ConflictQueue,
    registry: Arc<SubscriptionRegistry>,
    notifier: Notifier,
    archive: Arc<ArchiveManager>,
    schemas: SchemaRegistry,
    ids: Arc<IdAllocator>,
    metrics: Metrics,
    write_timeout: Duration,
    _runner: Option<ArchiveRunner>,
    /// Held for the store's lifetime to fence out other processes.
    _dir_lock: Option<File>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open a store with the given configuration.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let (backend, cold, dir_lock): (Arc<dyn KvBackend>, Arc<dyn ColdStore>, Option<File>) =
            match &config.path {
                Some(root) => {
                    std::fs::create_dir_all(root)?;
                    let lock = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .open(root.join(LOCK_FILE))?;
                    lock.try_lock_exclusive().map_err(|_| StoreError::Locked)?;
                    let backend =
                        FileBackend::new(root.join("data"), config.backend_cache_size)?;
                    let cold = FileColdStore::new(root.join("cold"))?;
                    (Arc::new(backend), Arc::new(cold), Some(lock))
                }
                None => (
                    Arc::new(MemoryBackend::new()),
                    Arc::new(MemoryColdStore::new()),
                    None,
                ),
            };

        let ids = Arc::new(IdAllocator::open(backend.clone())?);
        let chain = Arc::new(ChainStore::open(backend.clone(), ids.clone())?);
        let conflicts = ConflictQueue::open(backend.clone(), ids.clone())?;
        let cache = Arc::new(ActiveStateCache::new(config.cache_capacity, config.cache_ttl));
        let registry = Arc::new(SubscriptionRegistry::new(config.subscriber_buffer));
        let notifier = Notifier::spawn(registry.clone(), config.notifier.clone());
        let archive = Arc::new(ArchiveManager::new(
            backend,
            chain.clone(),
            cold,
            ids.clone(),
            config.archive_policy.clone(),
        ));
        let runner = config.start_background.then(|| {
            ArchiveRunner::spawn(archive.clone(), cache.clone(), config.sweep_interval)
        });

        info!(
            workflows = chain.workflows().len(),
            pending_conflicts = conflicts.pending_count(),
            file_backed = config.path.is_some(),
            "store opened"
        );

        Ok(Self {
            chain,
            cache,
            conflicts,
            registry,
            notifier,
            archive,
            schemas: SchemaRegistry::with_default(),
            ids,
            metrics: Metrics::default(),
            write_timeout: config.write_timeout,
            _runner: runner,
            _dir_lock: dir_lock,
        })
    }

    // --- Writes ---

    /// Persist a new state for a workflow on top of `base_version`.
    ///
    /// On a base-version mismatch the write goes through conflict
    /// detection: disjoint-field collisions are auto-merged onto the
    /// current head and retried; overlapping collisions escalate and the
    /// call fails with `StoreError::Conflict` carrying the conflict id.
    pub fn persist_state(
        &self,
        workflow: &WorkflowId,
        base_version: Version,
        state: WorkflowState,
        author: AgentId,
        description: impl Into<String>,
    ) -> Result<StateVersion> {
        if !workflow.is_valid() {
            return Err(StoreError::Validation(format!(
                "invalid workflow id: {workflow}"
            )));
        }
        self.schemas.validate(&state)?;

        let head = self.chain.head_version(workflow);
        if head == Version::INITIAL && base_version != Version::INITIAL {
            return Err(StoreError::WorkflowNotFound(workflow.clone()));
        }

        let description = description.into();

        // State of the version the write is based on, used both for the
        // change diff after commit and as the merge base on conflict.
        let mut parent_state = if base_version == Version::INITIAL {
            WorkflowState::new(state.schema.clone())
        } else {
            self.chain.get(workflow, Some(base_version))?.state
        };

        let mut attempt_state = state.clone();
        let mut attempt_base = base_version;
        let mut pending_merge: Option<ConflictId> = None;
        let started = Instant::now();

        for attempt in 0..MAX_WRITE_ATTEMPTS {
            // A write that can commit on the first try always commits; the
            // deadline bounds the merge-and-retry cycle.
            if attempt > 0 && started.elapsed() > self.write_timeout {
                if let Some(conflict_id) = pending_merge {
                    let head = self.chain.head_version(workflow);
                    self.escalate(workflow, conflict_id, head, base_version, vec![])?;
                }
                return Err(StoreError::StorageTimeout(format!(
                    "write to {workflow} exceeded {:?}",
                    self.write_timeout
                )));
            }
            let outcome = self.chain.append(
                workflow,
                attempt_base,
                attempt_state.clone(),
                author.clone(),
                description.clone(),
            )?;

            match outcome {
                AppendOutcome::Committed(record) => {
                    if let Some(conflict_id) = pending_merge {
                        // Concurrent writers can share one conflict record;
                        // whoever commits first resolves it for everyone.
                        match self.conflicts.resolve(
                            conflict_id,
                            ResolutionStrategy::AutoMerge,
                            Some(record.version),
                        ) {
                            Ok(_) => Metrics::bump(&self.metrics.conflicts_auto_resolved),
                            Err(StoreError::ConflictNotFound(_)) => {}
                            Err(err) => return Err(err),
                        }
                    }
                    Metrics::bump(&self.metrics.writes_committed);
                    self.finish_commit(workflow, &parent_state, &record)?;
                    return Ok(record);
                }
                AppendOutcome::Mismatch { head } => {
                    // A mismatch after an auto-merge is the same logical
                    // collision racing a fast-moving head, not a new one.
                    let conflict_id = match pending_merge {
                        Some(id) => id,
                        None => {
                            let conflict = self.conflicts.detect(
                                workflow,
                                head,
                                attempt_base.next(),
                                CompetingWrite {
                                    author: author.clone(),
                                    state: state.clone(),
                                    description: description.clone(),
                                    submitted_at: Timestamp::now(),
                                },
                            )?;
                            Metrics::bump(&self.metrics.conflicts_detected);
                            self.conflicts.mark_auto_resolving(conflict.id)?;
                            conflict.id
                        }
                    };

                    let head_record = match self.chain.get(workflow, None) {
                        Ok(record) => record,
                        Err(err) => {
                            self.escalate(workflow, conflict_id, head, base_version, vec![])?;
                            return Err(err);
                        }
                    };

                    match merge_states(&parent_state, &head_record.state, &state) {
                        MergeOutcome::Merged {
                            state: merged,
                            candidate_paths,
                        } => {
                            debug!(
                                workflow = %workflow,
                                conflict = %conflict_id,
                                paths = ?candidate_paths,
                                "auto-merging disjoint write onto head"
                            );
                            parent_state = head_record.state;
                            attempt_state = merged;
                            attempt_base = head_record.version;
                            pending_merge = Some(conflict_id);
                        }
                        MergeOutcome::Overlap(paths) => {
                            self.escalate(workflow, conflict_id, head, base_version, paths)?;
                            return Err(StoreError::Conflict {
                                workflow: workflow.clone(),
                                conflict: conflict_id,
                                base: base_version,
                                head,
                            });
                        }
                    }
                }
            }
        }

        // The head kept moving under the merge. Give up and escalate the
        // last detected conflict rather than loop forever.
        let head = self.chain.head_version(workflow);
        if let Some(conflict_id) = pending_merge {
            self.escalate(workflow, conflict_id, head, base_version, vec![])?;
            return Err(StoreError::Conflict {
                workflow: workflow.clone(),
                conflict: conflict_id,
                base: base_version,
                head,
            });
        }
        Err(StoreError::InvalidOperation(
            "write retry budget exhausted".into(),
        ))
    }

    fn escalate(
        &self,
        workflow: &WorkflowId,
        conflict: ConflictId,
        head: Version,
        base: Version,
        overlapping_paths: Vec<String>,
    ) -> Result<()> {
        match self.conflicts.escalate(conflict, overlapping_paths) {
            Ok(()) => Metrics::bump(&self.metrics.conflicts_escalated),
            // Already settled by a concurrent writer sharing the record.
            Err(StoreError::ConflictNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        }
        debug!(
            workflow = %workflow,
            conflict = %conflict,
            head = %head,
            base = %base,
            "conflict escalated for explicit resolution"
        );
        Ok(())
    }

    /// Post-commit bookkeeping: update the cache and fan out one change
    /// event per field path that differs from the parent state.
    fn finish_commit(
        &self,
        workflow: &WorkflowId,
        parent_state: &WorkflowState,
        record: &StateVersion,
    ) -> Result<()> {
        self.cache
            .apply(workflow, record.version, record.state.clone());

        for path in crate::conflict::changed_paths(parent_state, &record.state) {
            let change = StateChange {
                id: self.ids.next_change_id()?,
                workflow_id: workflow.clone(),
                kind: ChangeKind::from_path(&path),
                old_value: value_at(parent_state, &path),
                new_value: value_at(&record.state, &path),
                path,
                timestamp: record.timestamp,
                agent_id: record.author.clone(),
                version: record.version,
            };
            if !self.notifier.enqueue(change) {
                self.registry.record_input_drop();
            }
        }
        Ok(())
    }

    // --- Reads ---

    /// Current head state and version for a workflow.
    pub fn get_state(&self, workflow: &WorkflowId) -> Result<(WorkflowState, Version)> {
        if let Some(hit) = self.cache.read(workflow) {
            Metrics::bump(&self.metrics.cache_hits);
            return Ok(hit);
        }
        Metrics::bump(&self.metrics.cache_misses);
        let record = self.chain.get(workflow, None)?;
        self.cache
            .apply(workflow, record.version, record.state.clone());
        Ok((record.state, record.version))
    }

    /// A specific committed version.
    pub fn get_version(&self, workflow: &WorkflowId, version: Version) -> Result<StateVersion> {
        self.chain.get(workflow, Some(version))
    }

    /// A version retired to cold storage by the archive sweep.
    pub fn get_archived_version(
        &self,
        workflow: &WorkflowId,
        version: Version,
    ) -> Result<StateVersion> {
        self.archive.fetch_archived(workflow, version)
    }

    /// A page of the workflow's history, newest first.
    pub fn history(
        &self,
        workflow: &WorkflowId,
        before: Option<Version>,
        limit: usize,
    ) -> Result<History> {
        self.chain.history(workflow, before, limit)
    }

    /// Workflows with at least one committed version.
    pub fn workflows(&self) -> Vec<WorkflowId> {
        self.chain.workflows()
    }

    // --- Subscriptions ---

    /// Subscribe an agent to a workflow's change events.
    pub fn subscribe(&self, workflow: &WorkflowId, agent: &AgentId) -> Result<DeliveryHandle> {
        if !workflow.is_valid() {
            return Err(StoreError::Validation(format!(
                "invalid workflow id: {workflow}"
            )));
        }
        Ok(self.registry.subscribe(workflow, agent))
    }

    /// Remove a subscription. Returns whether one existed.
    pub fn unsubscribe(&self, workflow: &WorkflowId, agent: &AgentId) -> bool {
        self.registry.unsubscribe(workflow, agent)
    }

    // --- Snapshots ---

    /// Capture the current head state as a named snapshot.
    pub fn create_snapshot(
        &self,
        workflow: &WorkflowId,
        description: impl Into<String>,
    ) -> Result<StateSnapshot> {
        let snapshot = self.archive.create_snapshot(workflow, description.into())?;
        Metrics::bump(&self.metrics.snapshots_created);
        Ok(snapshot)
    }

    pub fn get_snapshot(&self, workflow: &WorkflowId, id: SnapshotId) -> Result<StateSnapshot> {
        self.archive.get_snapshot(workflow, id)
    }

    pub fn list_snapshots(&self, workflow: &WorkflowId) -> Result<Vec<StateSnapshot>> {
        self.archive.list_snapshots(workflow)
    }

    pub fn delete_snapshot(&self, workflow: &WorkflowId, id: SnapshotId) -> Result<()> {
        self.archive.delete_snapshot(workflow, id)
    }

    /// Restore a snapshot by committing its state as a new head version.
    ///
    /// History is preserved: nothing is rewritten, the restored state
    /// simply becomes the next version in the chain.
    pub fn restore_snapshot(
        &self,
        workflow: &WorkflowId,
        id: SnapshotId,
        author: AgentId,
    ) -> Result<StateVersion> {
        let snapshot = self.archive.get_snapshot(workflow, id)?;
        let head = self.chain.head_version(workflow);
        self.persist_state(
            workflow,
            head,
            snapshot.state,
            author,
            format!("restore snapshot {} (taken at version {})", id, snapshot.version),
        )
    }

    // --- Conflicts ---

    /// Pending conflicts, oldest first.
    pub fn pending_conflicts(&self) -> Vec<StateConflict> {
        self.conflicts.pending()
    }

    pub fn get_conflict(&self, id: ConflictId) -> Result<StateConflict> {
        self.conflicts.get(id)
    }

    /// Explicitly resolve an escalated conflict.
    ///
    /// `AcceptIncoming` replays the competing write on the current head,
    /// `KeepCurrent` discards it, `Manual` commits a caller-supplied
    /// state, and `AutoMerge` re-attempts the deterministic merge.
    pub fn resolve_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        resolver: AgentId,
    ) -> Result<StateConflict> {
        let conflict = self.conflicts.get(id)?;
        let workflow = conflict.workflow_id.clone();
        let incoming = conflict
            .competing_writes
            .last()
            .cloned()
            .ok_or_else(|| StoreError::Corruption(format!("conflict {id} has no writes")))?;

        let resulting_version = match &strategy {
            ResolutionStrategy::KeepCurrent => None,
            ResolutionStrategy::AcceptIncoming => Some(self.commit_resolution(
                &workflow,
                incoming.state,
                resolver,
                format!("accept competing write for conflict {id}"),
            )?),
            ResolutionStrategy::Manual { state } => {
                self.schemas.validate(state)?;
                Some(self.commit_resolution(
                    &workflow,
                    state.clone(),
                    resolver,
                    format!("manual resolution of conflict {id}"),
                )?)
            }
            ResolutionStrategy::AutoMerge => {
                let base_state = match conflict.attempted_version.prev() {
                    Some(base) => self.chain.get(&workflow, Some(base))?.state,
                    None => WorkflowState::new(incoming.state.schema.clone()),
                };
                let head = self.chain.get(&workflow, None)?;
                match merge_states(&base_state, &head.state, &incoming.state) {
                    MergeOutcome::Merged { state, .. } => Some(self.commit_resolution(
                        &workflow,
                        state,
                        resolver,
                        format!("auto-merge resolution of conflict {id}"),
                    )?),
                    MergeOutcome::Overlap(paths) => {
                        return Err(StoreError::InvalidOperation(format!(
                            "cannot auto-merge conflict {id}: paths overlap: {}",
                            paths.join(", ")
                        )))
                    }
                }
            }
        };

        self.conflicts.resolve(id, strategy, resulting_version)
    }

    /// Commit a resolution state on whatever the head is, without going
    /// back through conflict detection.
    fn commit_resolution(
        &self,
        workflow: &WorkflowId,
        state: WorkflowState,
        author: AgentId,
        description: String,
    ) -> Result<Version> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let head = self.chain.head_version(workflow);
            let parent_state = if head == Version::INITIAL {
                WorkflowState::new(state.schema.clone())
            } else {
                self.chain.get(workflow, Some(head))?.state
            };
            match self.chain.append(
                workflow,
                head,
                state.clone(),
                author.clone(),
                description.clone(),
            )? {
                AppendOutcome::Committed(record) => {
                    Metrics::bump(&self.metrics.writes_committed);
                    self.finish_commit(workflow, &parent_state, &record)?;
                    return Ok(record.version);
                }
                AppendOutcome::Mismatch { .. } => continue,
            }
        }
        Err(StoreError::InvalidOperation(
            "write retry budget exhausted".into(),
        ))
    }

    // --- Validation and schemas ---

    /// Validate a state against its registered schema without writing.
    pub fn validate_state(&self, state: &WorkflowState) -> Result<()> {
        self.schemas.validate(state)
    }

    /// Register (or replace) a state schema.
    pub fn register_schema(&self, schema: StateSchema) {
        self.schemas.register(schema);
    }

    // --- Archive ---

    /// Run one archive sweep synchronously.
    pub fn archive_old_versions(&self) -> Result<SweepReport> {
        let report = self.archive.sweep()?;
        self.metrics
            .versions_archived
            .fetch_add(report.versions_archived, Ordering::Relaxed);
        Ok(report)
    }

    /// Override the retention policy for one workflow.
    pub fn set_archive_policy(&self, workflow: &WorkflowId, policy: ArchivePolicy) {
        self.archive.set_policy(workflow, policy);
    }

    // --- Metrics ---

    pub fn metrics(&self) -> StoreStats {
        StoreStats {
            writes_committed: self.metrics.writes_committed.load(Ordering::Relaxed),
            conflicts_detected: self.metrics.conflicts_detected.load(Ordering::Relaxed),
            conflicts_auto_resolved: self
                .metrics
                .conflicts_auto_resolved
                .load(Ordering::Relaxed),
            conflicts_escalated: self.metrics.conflicts_escalated.load(Ordering::Relaxed),
            notifications_delivered: self.registry.delivered_count(),
            notifications_dropped: self.registry.dropped_count(),
            cache_hits: self.metrics.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.metrics.cache_misses.load(Ordering::Relaxed),
            versions_archived: self.metrics.versions_archived.load(Ordering::Relaxed),
            snapshots_created: self.metrics.snapshots_created.load(Ordering::Relaxed),
            workflow_count: self.chain.workflows().len() as u64,
        }
    }
}

/// Value at a dotted field path, if present.
fn value_at(state: &WorkflowState, path: &str) -> Option<serde_json::Value> {
    let mut segments = path.split('.');
    let mut current = state.fields.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}
