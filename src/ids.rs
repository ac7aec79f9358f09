//! Persistent id allocation.
//!
//! Version, snapshot, conflict, and change ids are unique across restarts.
//! The allocator reserves ids in blocks so a single backend write covers
//! many allocations; on reopen it skips to the end of the last reserved
//! block, which may leave gaps but never reuses an id.

use crate::backend::{keys, KvBackend};
use crate::codec;
use crate::error::Result;
use crate::types::{ChangeId, ConflictId, SnapshotId, VersionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Ids reserved per backend write.
const BLOCK_SIZE: u64 = 128;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct IdBlock {
    version: u64,
    snapshot: u64,
    conflict: u64,
    change: u64,
}

struct Counters {
    next: IdBlock,
    reserved: IdBlock,
}

/// Allocator for store-wide ids, persisted through the backend.
pub struct IdAllocator {
    backend: Arc<dyn KvBackend>,
    counters: Mutex<Counters>,
}

impl IdAllocator {
    pub fn open(backend: Arc<dyn KvBackend>) -> Result<Self> {
        let reserved = match backend.get(keys::IDS)? {
            Some(bytes) => codec::decode(&bytes)?,
            None => IdBlock::default(),
        };
        Ok(Self {
            backend,
            counters: Mutex::new(Counters {
                next: reserved,
                reserved,
            }),
        })
    }

    fn next(
        &self,
        pick: impl Fn(&mut IdBlock) -> &mut u64,
    ) -> Result<u64> {
        let mut counters = self.counters.lock();
        let id = {
            let slot = pick(&mut counters.next);
            let id = *slot + 1;
            *slot = id;
            id
        };
        if id > *pick(&mut counters.reserved) {
            let mut reserved = counters.reserved;
            *pick(&mut reserved) = id + BLOCK_SIZE;
            self.backend.put(keys::IDS, &codec::encode(&reserved)?)?;
            counters.reserved = reserved;
        }
        Ok(id)
    }

    pub fn next_version_id(&self) -> Result<VersionId> {
        self.next(|b| &mut b.version).map(VersionId)
    }

    pub fn next_snapshot_id(&self) -> Result<SnapshotId> {
        self.next(|b| &mut b.snapshot).map(SnapshotId)
    }

    pub fn next_conflict_id(&self) -> Result<ConflictId> {
        self.next(|b| &mut b.conflict).map(ConflictId)
    }

    pub fn next_change_id(&self) -> Result<ChangeId> {
        self.next(|b| &mut b.change).map(ChangeId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn test_ids_are_sequential() {
        let backend = Arc::new(MemoryBackend::new());
        let ids = IdAllocator::open(backend).unwrap();
        assert_eq!(ids.next_version_id().unwrap(), VersionId(1));
        assert_eq!(ids.next_version_id().unwrap(), VersionId(2));
        assert_eq!(ids.next_snapshot_id().unwrap(), SnapshotId(1));
    }

    #[test]
    fn test_no_reuse_after_reopen() {
        let backend: Arc<MemoryBackend> = Arc::new(MemoryBackend::new());
        let first = {
            let ids = IdAllocator::open(backend.clone()).unwrap();
            ids.next_conflict_id().unwrap()
        };
        let ids = IdAllocator::open(backend).unwrap();
        let second = ids.next_conflict_id().unwrap();
        assert!(second.0 > first.0);
    }
}
