//! In-memory backend for tests and ephemeral deployments.

use super::kv::KvBackend;
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Backend keeping everything in a sorted map.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvBackend for MemoryBackend {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let keys = entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let backend = MemoryBackend::new();
        backend.put("a/b", b"one").unwrap();
        assert_eq!(backend.get("a/b").unwrap(), Some(b"one".to_vec()));
        assert!(backend.delete("a/b").unwrap());
        assert!(!backend.delete("a/b").unwrap());
        assert_eq!(backend.get("a/b").unwrap(), None);
    }

    #[test]
    fn test_list_prefix_sorted() {
        let backend = MemoryBackend::new();
        backend.put("wf/x/v/2", b"").unwrap();
        backend.put("wf/x/v/1", b"").unwrap();
        backend.put("wf/y/v/1", b"").unwrap();
        let keys = backend.list_prefix("wf/x/").unwrap();
        assert_eq!(keys, vec!["wf/x/v/1".to_string(), "wf/x/v/2".to_string()]);
    }
}
