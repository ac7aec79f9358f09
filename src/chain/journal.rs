//! Commit journal for crash-safe appends.
//!
//! A committed version touches two keys: the version record and the head
//! pointer. The journal stages an intent entry before the first write and
//! clears it after the head is updated. Recovery on open deletes version
//! records the head never reached, so a crashed append is invisible and a
//! retry with the same base version is safe.

use crate::backend::{keys, KvBackend};
use crate::codec;
use crate::error::Result;
use crate::types::{Timestamp, Version, WorkflowId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// A staged commit intent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub workflow_id: WorkflowId,
    /// Version the append intends to commit.
    pub version: Version,
    pub staged_at: Timestamp,
}

/// Journal of in-flight appends, persisted through the backend.
pub struct CommitJournal {
    backend: Arc<dyn KvBackend>,
    next_seq: AtomicU64,
}

impl CommitJournal {
    /// Open the journal and run recovery: any pending entry whose head
    /// pointer never advanced marks an orphan version record to remove.
    pub fn open(backend: Arc<dyn KvBackend>) -> Result<Self> {
        let mut max_seq = 0u64;
        for key in backend.list_prefix(keys::JOURNAL_PREFIX)? {
            let Some(bytes) = backend.get(&key)? else {
                continue;
            };
            let entry: JournalEntry = codec::decode(&bytes)?;
            max_seq = max_seq.max(entry.seq);
            Self::recover_entry(&*backend, &entry)?;
            backend.delete(&key)?;
        }
        Ok(Self {
            backend,
            next_seq: AtomicU64::new(max_seq + 1),
        })
    }

    fn recover_entry(backend: &dyn KvBackend, entry: &JournalEntry) -> Result<()> {
        let head_committed = match backend.get(&keys::head(&entry.workflow_id))? {
            Some(bytes) => {
                let head: super::store::HeadRecord = codec::decode(&bytes)?;
                head.version >= entry.version
            }
            None => false,
        };
        if !head_committed {
            let removed =
                backend.delete(&keys::version(&entry.workflow_id, entry.version))?;
            if removed {
                warn!(
                    workflow = %entry.workflow_id,
                    version = %entry.version,
                    "removed orphan version record left by interrupted append"
                );
            }
        }
        Ok(())
    }

    /// Stage an append. Returns the sequence to pass to [`Self::clear`].
    pub fn stage(&self, workflow: &WorkflowId, version: Version) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = JournalEntry {
            seq,
            workflow_id: workflow.clone(),
            version,
            staged_at: Timestamp::now(),
        };
        self.backend.put(&keys::journal(seq), &codec::encode(&entry)?)?;
        Ok(seq)
    }

    /// Clear a staged entry after the head pointer has been written.
    pub fn clear(&self, seq: u64) -> Result<()> {
        self.backend.delete(&keys::journal(seq))?;
        Ok(())
    }

    /// Pending entries (for inspection and tests).
    pub fn pending(&self) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        for key in self.backend.list_prefix(keys::JOURNAL_PREFIX)? {
            if let Some(bytes) = self.backend.get(&key)? {
                entries.push(codec::decode(&bytes)?);
            }
        }
        Ok(entries)
    }
}
