//! File-system backend: one sealed file per key.
//!
//! Keys map directly onto a directory tree under the backend root, so the
//! layout stays browsable. Values are wrapped in the checksummed envelope
//! from [`crate::codec`]; reads verify the CRC and surface corruption
//! instead of returning damaged bytes. A small LRU cache serves repeated
//! reads of hot keys.

use super::kv::KvBackend;
use crate::codec;
use crate::error::{Result, StoreError};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Backend writing each key as a sealed file.
pub struct FileBackend {
    root: PathBuf,
    cache: Mutex<LruCache<String, Vec<u8>>>,
}

impl FileBackend {
    /// Create a backend rooted at `root`, with an LRU read cache of
    /// `cache_size` entries.
    pub fn new(root: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let cache_size = NonZeroUsize::new(cache_size.max(1)).expect("non-zero cache size");
        Ok(Self {
            root,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.split('/').any(|seg| {
                seg.is_empty() || seg == "." || seg == ".." || seg.contains('\\')
            })
        {
            return Err(StoreError::InvalidOperation(format!("bad key: {key:?}")));
        }
        let mut path = self.root.clone();
        for seg in key.split('/') {
            path.push(seg);
        }
        Ok(path)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let segs: Vec<&str> = rel.iter().map(|s| s.to_str()).collect::<Option<_>>()?;
        Some(segs.join("/"))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk(&path, out)?;
            } else if path.extension().map_or(true, |ext| ext != "tmp") {
                if let Some(key) = self.key_for(&path) {
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

impl KvBackend for FileBackend {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a sibling temp file and rename, so readers never see a
        // half-written value.
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&codec::seal(bytes))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        self.cache.lock().put(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.cache.lock().get(key).cloned() {
            return Ok(Some(cached));
        }

        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }

        let mut sealed = Vec::new();
        File::open(&path)?.read_to_end(&mut sealed)?;
        let bytes = codec::unseal(&sealed)
            .map_err(|e| StoreError::Corruption(format!("{key}: {e}")))?;

        self.cache.lock().put(key.to_string(), bytes.clone());
        Ok(Some(bytes))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.cache.lock().pop(key);
        let path = self.path_for(key)?;
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if self.root.exists() {
            self.walk(&self.root.clone(), &mut keys)?;
        }
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().join("kv"), 16).unwrap();

        backend.put("wf/a/head", b"pointer").unwrap();
        assert_eq!(backend.get("wf/a/head").unwrap(), Some(b"pointer".to_vec()));
        assert_eq!(backend.get("wf/a/missing").unwrap(), None);
    }

    #[test]
    fn test_persistence_across_instances() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("kv");
        {
            let backend = FileBackend::new(&root, 16).unwrap();
            backend.put("wf/a/v/1", b"one").unwrap();
        }
        let backend = FileBackend::new(&root, 16).unwrap();
        assert_eq!(backend.get("wf/a/v/1").unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn test_list_prefix() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().join("kv"), 16).unwrap();
        backend.put("wf/a/v/00000000000000000002", b"").unwrap();
        backend.put("wf/a/v/00000000000000000001", b"").unwrap();
        backend.put("wf/b/v/00000000000000000001", b"").unwrap();

        let keys = backend.list_prefix("wf/a/v/").unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0] < keys[1]);
    }

    #[test]
    fn test_corrupted_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().join("kv"), 16).unwrap();
        backend.put("wf/a/v/1", b"precious bytes").unwrap();

        // Flip a payload byte on disk, then bypass the cache.
        let path = dir.path().join("kv/wf/a/v/1");
        let mut file = fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xff]).unwrap();
        drop(file);

        let fresh = FileBackend::new(dir.path().join("kv"), 16).unwrap();
        let err = fresh.get("wf/a/v/1").unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
    }

    #[test]
    fn test_rejects_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().join("kv"), 16).unwrap();
        assert!(backend.put("../escape", b"no").is_err());
        assert!(backend.put("a//b", b"no").is_err());
    }
}
