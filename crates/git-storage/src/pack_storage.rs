//! Pack storage (C6): upload/download of whole packfiles and their indices
//! through a `BlobStore`, plus lease-based locking so only one actor
//! repacks or migrates a given pack at a time.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::blob_store::BlobStore;
use crate::StorageError;

/// Metadata recorded alongside a stored pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackMetadata {
    pub pack_id: String,
    pub size: u64,
    pub object_count: u32,
}

/// Opaque lease token proving current ownership of a pack's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

struct Lease {
    token: String,
    expires_at: Instant,
}

/// Pack storage backed by a `BlobStore`, with an in-process lease table for
/// `acquirePackLock`/`releasePackLock`. A multi-process deployment would
/// back the lease table with the hot store's `locks` table instead; this
/// in-memory table is sufficient for a single server instance.
pub struct PackStorage<B: BlobStore> {
    blobs: B,
    leases: Mutex<HashMap<String, Lease>>,
}

const PACK_PREFIX: &str = "packs";
const LEASE_TTL: Duration = Duration::from_secs(30);

impl<B: BlobStore> PackStorage<B> {
    pub fn new(blobs: B) -> Self {
        Self {
            blobs,
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn pack_key(pack_id: &str) -> String {
        format!("{}/{}.pack", PACK_PREFIX, pack_id)
    }

    fn idx_key(pack_id: &str) -> String {
        format!("{}/{}.idx", PACK_PREFIX, pack_id)
    }

    fn meta_key(pack_id: &str) -> String {
        format!("{}/{}.meta", PACK_PREFIX, pack_id)
    }

    pub fn upload_pack(
        &self,
        pack_id: &str,
        pack_bytes: &[u8],
        idx_bytes: &[u8],
        object_count: u32,
    ) -> Result<(), StorageError> {
        self.blobs.put(&Self::pack_key(pack_id), pack_bytes)?;
        self.blobs.put(&Self::idx_key(pack_id), idx_bytes)?;
        let meta = PackMetadata {
            pack_id: pack_id.to_string(),
            size: pack_bytes.len() as u64,
            object_count,
        };
        self.blobs
            .put(&Self::meta_key(pack_id), serialize_meta(&meta).as_bytes())?;
        Ok(())
    }

    pub fn download_pack(&self, pack_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.blobs.get(&Self::pack_key(pack_id))
    }

    pub fn download_index(&self, pack_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.blobs.get(&Self::idx_key(pack_id))
    }

    pub fn get_metadata(&self, pack_id: &str) -> Result<Option<PackMetadata>, StorageError> {
        match self.blobs.get(&Self::meta_key(pack_id))? {
            Some(bytes) => Ok(Some(deserialize_meta(&bytes, pack_id))),
            None => Ok(None),
        }
    }

    pub fn list_packs(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .blobs
            .list(PACK_PREFIX)?
            .into_iter()
            .filter_map(|key| key.strip_suffix(".pack").map(|s| {
                s.rsplit('/').next().unwrap_or(s).to_string()
            }))
            .collect())
    }

    pub fn delete_pack(&self, pack_id: &str) -> Result<(), StorageError> {
        self.blobs.delete(&Self::pack_key(pack_id))?;
        self.blobs.delete(&Self::idx_key(pack_id))?;
        self.blobs.delete(&Self::meta_key(pack_id))?;
        Ok(())
    }

    /// Acquire an exclusive lease on `pack_id`, retrying with bounded
    /// backoff until `max_attempts` is exhausted. Expired leases (held past
    /// `LEASE_TTL` by a crashed actor) are reclaimed automatically.
    pub fn acquire_pack_lock(
        &self,
        pack_id: &str,
        max_attempts: u32,
    ) -> Result<LeaseToken, StorageError> {
        for attempt in 0..max_attempts {
            {
                let mut leases = self.leases.lock().expect("lease table poisoned");
                let now = Instant::now();
                let stale = leases
                    .get(pack_id)
                    .map(|l| l.expires_at < now)
                    .unwrap_or(true);
                if stale {
                    let token = format!("{}-{}", pack_id, attempt);
                    leases.insert(
                        pack_id.to_string(),
                        Lease {
                            token: token.clone(),
                            expires_at: now + LEASE_TTL,
                        },
                    );
                    return Ok(LeaseToken(token));
                }
            }
            std::thread::sleep(crate::backoff_delay(attempt, 10, 500));
        }
        Err(StorageError::LockTimeout(pack_id.to_string()))
    }

    pub fn release_pack_lock(
        &self,
        pack_id: &str,
        token: &LeaseToken,
    ) -> Result<(), StorageError> {
        let mut leases = self.leases.lock().expect("lease table poisoned");
        match leases.get(pack_id) {
            Some(lease) if lease.token == token.0 => {
                leases.remove(pack_id);
                Ok(())
            }
            Some(_) => Err(StorageError::Conflict(format!(
                "lease token mismatch for {}",
                pack_id
            ))),
            None => Ok(()),
        }
    }
}

fn serialize_meta(meta: &PackMetadata) -> String {
    format!("{}\n{}\n{}\n", meta.pack_id, meta.size, meta.object_count)
}

fn deserialize_meta(bytes: &[u8], pack_id: &str) -> PackMetadata {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines();
    lines.next();
    let size = lines.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let object_count = lines.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    PackMetadata {
        pack_id: pack_id.to_string(),
        size,
        object_count,
    }
}
