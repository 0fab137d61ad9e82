//! Blob store adapter (C5): put/get/list/delete of named blobs, with a
//! conditional put for single-writer invariants.
//!
//! The filesystem implementation follows the same atomic-write discipline
//! as a git lock file: write to a sibling temp file, fsync, then rename
//! into place. A sidecar `.etag` file (the blob's content SHA-256, hex)
//! gives `conditional_put` a cheap compare-and-swap without a real object
//! store's native ETag support.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::StorageError;

/// Pluggable blob storage backend. `warm`-tier packs, pack indices, and the
/// MIDX pointer are all stored through this trait.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Etag of the current value at `key`, if any.
    fn etag(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `bytes` at `key` only if the current etag equals
    /// `expected_etag` (`None` means "key must not exist"). Returns the new
    /// etag on success, or `StorageError::Conflict` if the precondition
    /// failed.
    fn conditional_put(
        &self,
        key: &str,
        bytes: &[u8],
        expected_etag: Option<&str>,
    ) -> Result<String, StorageError>;
}

fn compute_etag(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Filesystem-backed `BlobStore` rooted at a directory. Keys are relative
/// slash-separated paths (`packs/abc123.pack`); directories are created
/// lazily.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn etag_path_for(&self, key: &str) -> PathBuf {
        let mut p = self.path_for(key).into_os_string();
        p.push(".etag");
        PathBuf::from(p)
    }

    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("blob")
        ));
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        self.atomic_write(&path, bytes)?;
        let etag = compute_etag(bytes);
        self.atomic_write(&self.etag_path_for(key), etag.as_bytes())?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.root.join(prefix);
        let mut out = Vec::new();
        if !dir.is_dir() {
            return Ok(out);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".etag") || name.ends_with(".tmp") {
                continue;
            }
            out.push(format!("{}/{}", prefix.trim_end_matches('/'), name));
        }
        out.sort();
        Ok(out)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let etag_path = self.etag_path_for(key);
        if etag_path.exists() {
            fs::remove_file(&etag_path)?;
        }
        Ok(())
    }

    fn etag(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.etag_path_for(key)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn conditional_put(
        &self,
        key: &str,
        bytes: &[u8],
        expected_etag: Option<&str>,
    ) -> Result<String, StorageError> {
        let current = self.etag(key)?;
        if current.as_deref() != expected_etag {
            return Err(StorageError::Conflict(key.to_string()));
        }
        self.put(key, bytes)?;
        Ok(self.etag(key)?.expect("etag just written"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        store.put("packs/a.pack", b"hello").unwrap();
        assert_eq!(store.get("packs/a.pack").unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn get_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn conditional_put_create_requires_none_etag() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        assert!(store.conditional_put("k", b"v1", None).is_ok());
        assert!(matches!(
            store.conditional_put("k", b"v2", None),
            Err(StorageError::Conflict(_))
        ));
    }

    #[test]
    fn conditional_put_cas_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        let etag1 = store.conditional_put("k", b"v1", None).unwrap();
        let etag2 = store.conditional_put("k", b"v2", Some(&etag1)).unwrap();
        assert_ne!(etag1, etag2);
        // Stale etag now fails.
        assert!(matches!(
            store.conditional_put("k", b"v3", Some(&etag1)),
            Err(StorageError::Conflict(_))
        ));
    }

    #[test]
    fn delete_removes_value_and_etag() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        store.put("k", b"v").unwrap();
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        assert_eq!(store.etag("k").unwrap(), None);
    }

    #[test]
    fn list_filters_sidecar_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        store.put("packs/a.pack", b"1").unwrap();
        store.put("packs/b.pack", b"2").unwrap();
        let listed = store.list("packs").unwrap();
        assert_eq!(listed, vec!["packs/a.pack", "packs/b.pack"]);
    }
}
