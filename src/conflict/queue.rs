//! Durable queue of detected write collisions.
//!
//! Conflicts are persisted through the backend so an escalated collision
//! survives a restart. A resolved conflict is removed from the queue; the
//! resolution itself lives on as an ordinary version in the chain.

use crate::backend::{keys, KvBackend};
use crate::codec;
use crate::error::{Result, StoreError};
use crate::ids::IdAllocator;
use crate::types::{
    CompetingWrite, ConflictId, ConflictStatus, ResolutionStrategy, StateConflict, Timestamp,
    Version, WorkflowId,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Queue of unresolved `StateConflict` records.
pub struct ConflictQueue {
    backend: Arc<dyn KvBackend>,
    ids: Arc<IdAllocator>,
    pending: RwLock<HashMap<ConflictId, StateConflict>>,
}

impl ConflictQueue {
    /// Open the queue, loading unresolved conflicts from the backend.
    pub fn open(backend: Arc<dyn KvBackend>, ids: Arc<IdAllocator>) -> Result<Self> {
        let mut pending = HashMap::new();
        for key in backend.list_prefix(keys::CONFLICT_PREFIX)? {
            if let Some(bytes) = backend.get(&key)? {
                let conflict: StateConflict = codec::decode(&bytes)?;
                pending.insert(conflict.id, conflict);
            }
        }
        Ok(Self {
            backend,
            ids,
            pending: RwLock::new(pending),
        })
    }

    /// Record a detected collision.
    ///
    /// A workflow has at most one active conflict per contested version:
    /// a second competing write against the same head joins the existing
    /// record instead of opening a new one.
    pub fn detect(
        &self,
        workflow: &WorkflowId,
        head_version: Version,
        attempted_version: Version,
        write: CompetingWrite,
    ) -> Result<StateConflict> {
        let mut pending = self.pending.write();

        if let Some(existing) = pending.values_mut().find(|c| {
            c.workflow_id == *workflow
                && c.attempted_version == attempted_version
                && !c.status.is_resolved()
        }) {
            existing.competing_writes.push(write);
            self.persist(existing)?;
            return Ok(existing.clone());
        }

        let conflict = StateConflict {
            id: self.ids.next_conflict_id()?,
            workflow_id: workflow.clone(),
            attempted_version,
            base_version: head_version,
            competing_writes: vec![write],
            detected_at: Timestamp::now(),
            status: ConflictStatus::Detected,
        };
        self.persist(&conflict)?;
        warn!(
            workflow = %workflow,
            conflict = %conflict.id,
            head = %head_version,
            attempted = %attempted_version,
            "write conflict detected"
        );
        pending.insert(conflict.id, conflict.clone());
        Ok(conflict)
    }

    /// Move a conflict into the auto-resolving state.
    pub fn mark_auto_resolving(&self, id: ConflictId) -> Result<()> {
        self.update(id, |c| c.status = ConflictStatus::AutoResolving)
    }

    /// Mark a conflict escalated: auto-merge could not settle it and an
    /// explicit resolution is required.
    pub fn escalate(&self, id: ConflictId, overlapping_paths: Vec<String>) -> Result<()> {
        self.update(id, |c| {
            c.status = ConflictStatus::Escalated { overlapping_paths }
        })
    }

    /// Resolve a conflict and remove it from the queue.
    ///
    /// Returns the final record for auditing. The backing entry is
    /// deleted; the resolution's effect, if any, is a chain version.
    pub fn resolve(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        resulting_version: Option<Version>,
    ) -> Result<StateConflict> {
        let mut pending = self.pending.write();
        let mut conflict = pending
            .remove(&id)
            .ok_or(StoreError::ConflictNotFound(id))?;
        conflict.status = ConflictStatus::Resolved {
            strategy,
            resulting_version,
        };
        self.backend.delete(&keys::conflict(id))?;
        info!(
            workflow = %conflict.workflow_id,
            conflict = %id,
            resulting_version = ?resulting_version,
            "conflict resolved"
        );
        Ok(conflict)
    }

    /// A pending conflict by id.
    pub fn get(&self, id: ConflictId) -> Result<StateConflict> {
        self.pending
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ConflictNotFound(id))
    }

    /// All pending conflicts, oldest first.
    pub fn pending(&self) -> Vec<StateConflict> {
        let mut conflicts: Vec<_> = self.pending.read().values().cloned().collect();
        conflicts.sort_by_key(|c| c.detected_at);
        conflicts
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    fn update(&self, id: ConflictId, apply: impl FnOnce(&mut StateConflict)) -> Result<()> {
        let mut pending = self.pending.write();
        let conflict = pending
            .get_mut(&id)
            .ok_or(StoreError::ConflictNotFound(id))?;
        apply(conflict);
        self.persist(conflict)
    }

    fn persist(&self, conflict: &StateConflict) -> Result<()> {
        self.backend
            .put(&keys::conflict(conflict.id), &codec::encode(conflict)?)
    }
}
