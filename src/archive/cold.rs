//! Cold storage for archived version batches.
//!
//! Cold storage is a bulk object store: batches go in keyed by workflow
//! and version range, and reads are best-effort historical lookups with
//! no read-after-write requirement.

use crate::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Bulk store for archived batches.
pub trait ColdStore: Send + Sync {
    /// Store a batch under a key.
    fn put_batch(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch a batch, if it exists.
    fn get_batch(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// All batch keys, sorted.
    fn list(&self) -> Result<Vec<String>>;
}

/// In-memory cold store for tests.
#[derive(Default)]
pub struct MemoryColdStore {
    batches: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryColdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ColdStore for MemoryColdStore {
    fn put_batch(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.batches.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get_batch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.batches.read().get(key).cloned())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.batches.read().keys().cloned().collect())
    }
}

/// Cold store writing one file per batch.
pub struct FileColdStore {
    root: PathBuf,
}

impl FileColdStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Batch keys are flat; encode separators so the file sits
        // directly under the root.
        self.root.join(key.replace('/', "__"))
    }
}

impl ColdStore for FileColdStore {
    fn put_batch(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let mut file = File::create(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    }

    fn get_batch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    keys.push(name.replace("__", "/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
