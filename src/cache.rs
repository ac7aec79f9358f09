//! Active state cache: the latest materialized state per workflow.
//!
//! Purely an acceleration layer. The chain store stays authoritative, so
//! eviction never loses data; a miss is rebuilt from the head version.

use crate::types::{Version, WorkflowId, WorkflowState};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

struct CacheEntry {
    state: WorkflowState,
    version: Version,
    touched: Instant,
}

/// In-memory index of head states, bounded by capacity and idle TTL.
pub struct ActiveStateCache {
    entries: Mutex<LruCache<WorkflowId, CacheEntry>>,
    ttl: Duration,
}

impl ActiveStateCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Read the cached head state, refreshing the idle clock.
    ///
    /// Entries idle past the TTL are treated as misses and dropped.
    pub fn read(&self, workflow: &WorkflowId) -> Option<(WorkflowState, Version)> {
        let mut entries = self.entries.lock();
        match entries.get_mut(workflow) {
            Some(entry) if entry.touched.elapsed() <= self.ttl => {
                entry.touched = Instant::now();
                Some((entry.state.clone(), entry.version))
            }
            Some(_) => {
                entries.pop(workflow);
                None
            }
            None => None,
        }
    }

    /// Apply a committed version to the cache.
    ///
    /// Only applied when `version` is strictly greater than the cached
    /// version, which guards against out-of-order application.
    pub fn apply(&self, workflow: &WorkflowId, version: Version, state: WorkflowState) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.peek(workflow) {
            if entry.version >= version {
                return;
            }
        }
        entries.put(
            workflow.clone(),
            CacheEntry {
                state,
                version,
                touched: Instant::now(),
            },
        );
    }

    /// Drop a workflow's entry.
    pub fn invalidate(&self, workflow: &WorkflowId) {
        self.entries.lock().pop(workflow);
    }

    /// Evict entries idle past the TTL. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let mut entries = self.entries.lock();
        let stale: Vec<WorkflowId> = entries
            .iter()
            .filter(|(_, e)| e.touched.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
