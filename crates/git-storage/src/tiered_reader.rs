//! Tiered reader (C11): resolves a read by consulting the object-location
//! index and falling back hot -> warm -> cold, optionally promoting a
//! warm/cold hit back into the hot tier.

use std::time::Instant;

use git_hash::ObjectId;

use crate::blob_store::BlobStore;
use crate::cold::ColdBackend;
use crate::hot_store::HotStore;
use crate::migrator::{AccessTracker, MigrationPolicy};
use crate::object_index::ObjectIndex;
use crate::pack_storage::PackStorage;
use crate::{StorageError, Tier};

/// Governs whether a tiered-reader hit on warm/cold is copied back into
/// hot storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionPolicy {
    /// Promote on every warm/cold hit.
    Aggressive,
    /// Promote only when the object's size is within `MigrationPolicy`'s
    /// `max_hot_bytes` and its `AccessTracker` score is at or above
    /// `min_access_count`.
    Conservative,
    /// Never promote; reads from warm/cold always re-read from warm/cold.
    None,
}

/// Result of a single `TieredReader::read` call.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub object: Vec<u8>,
    pub tier: Tier,
    pub promoted: bool,
    pub latency_ms: f64,
}

pub struct TieredReader<'a, B: BlobStore, C: ColdBackend> {
    hot: &'a HotStore,
    warm: &'a PackStorage<B>,
    cold: &'a C,
    policy: PromotionPolicy,
    migration_policy: MigrationPolicy,
    access_tracker: &'a AccessTracker,
}

impl<'a, B: BlobStore, C: ColdBackend> TieredReader<'a, B, C> {
    pub fn new(
        hot: &'a HotStore,
        warm: &'a PackStorage<B>,
        cold: &'a C,
        policy: PromotionPolicy,
        migration_policy: MigrationPolicy,
        access_tracker: &'a AccessTracker,
    ) -> Self {
        Self {
            hot,
            warm,
            cold,
            policy,
            migration_policy,
            access_tracker,
        }
    }

    /// Read an object's bytes, trying hot, then warm, then cold, per the
    /// location index. Returns `None` only if the index has no entry and
    /// no tier holds the object.
    pub fn read(&self, oid: &ObjectId) -> Result<Option<ReadResult>, StorageError> {
        let start = Instant::now();
        let index = ObjectIndex::new(self.hot);
        let location = index.lookup(oid)?;

        let tier_hint = location.as_ref().map(|l| l.tier);

        if tier_hint == Some(Tier::Hot) || tier_hint.is_none() {
            if let Some(bytes) = self.hot.get_object(oid)? {
                return Ok(Some(ReadResult {
                    object: bytes,
                    tier: Tier::Hot,
                    promoted: false,
                    latency_ms: elapsed_ms(start),
                }));
            }
        }

        if let Some(loc) = &location {
            if loc.tier == Tier::Warm {
                if let Some(pack_id) = &loc.pack_id {
                    if let Some(bytes) = self.warm.download_pack(pack_id)? {
                        let promoted = self.maybe_promote(oid, &bytes)?;
                        return Ok(Some(ReadResult {
                            object: bytes,
                            tier: Tier::Warm,
                            promoted,
                            latency_ms: elapsed_ms(start),
                        }));
                    }
                }
            }
        }

        if let Some(bytes) = self.cold.get(oid)? {
            let promoted = self.maybe_promote(oid, &bytes)?;
            return Ok(Some(ReadResult {
                object: bytes,
                tier: Tier::Cold,
                promoted,
                latency_ms: elapsed_ms(start),
            }));
        }

        Ok(None)
    }

    fn maybe_promote(&self, oid: &ObjectId, bytes: &[u8]) -> Result<bool, StorageError> {
        let should_promote = match self.policy {
            PromotionPolicy::Aggressive => true,
            PromotionPolicy::None => false,
            PromotionPolicy::Conservative => {
                bytes.len() as u64 <= self.migration_policy.max_hot_bytes
                    && self.access_tracker.score(oid) >= self.migration_policy.min_access_count
            }
        };
        if should_promote {
            self.hot.put_object(oid, 3, bytes, 0)?;
            let index = ObjectIndex::new(self.hot);
            index.record(
                oid,
                &crate::object_index::Location {
                    tier: Tier::Hot,
                    pack_id: None,
                    offset: None,
                    size: bytes.len() as u64,
                    object_type: 3,
                },
            )?;
        }
        Ok(should_promote)
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::FsBlobStore;
    use crate::cold::NullColdBackend;
    use crate::object_index::Location;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::Sha1([byte; 20])
    }

    #[test]
    fn reads_from_hot_when_no_index_entry() {
        let hot = HotStore::open_in_memory().unwrap();
        hot.put_object(&oid(1), 3, b"hot-data", 0).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let warm = PackStorage::new(FsBlobStore::open(dir.path()).unwrap());
        let cold = NullColdBackend;
        let tracker = AccessTracker::new(60.0);
        let reader = TieredReader::new(
            &hot,
            &warm,
            &cold,
            PromotionPolicy::None,
            MigrationPolicy::default(),
            &tracker,
        );
        let result = reader.read(&oid(1)).unwrap().unwrap();
        assert_eq!(result.object, b"hot-data");
        assert_eq!(result.tier, Tier::Hot);
        assert!(!result.promoted);
    }

    #[test]
    fn falls_back_to_warm_and_promotes_aggressively() {
        let hot = HotStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let warm = PackStorage::new(FsBlobStore::open(dir.path()).unwrap());
        warm.upload_pack("p1", b"warm-data", b"", 1).unwrap();
        let index = ObjectIndex::new(&hot);
        index
            .record(
                &oid(1),
                &Location {
                    tier: Tier::Warm,
                    pack_id: Some("p1".into()),
                    offset: Some(0),
                    size: 9,
                    object_type: 3,
                },
            )
            .unwrap();
        let cold = NullColdBackend;
        let tracker = AccessTracker::new(60.0);
        let reader = TieredReader::new(
            &hot,
            &warm,
            &cold,
            PromotionPolicy::Aggressive,
            MigrationPolicy::default(),
            &tracker,
        );
        let result = reader.read(&oid(1)).unwrap().unwrap();
        assert_eq!(result.object, b"warm-data");
        assert_eq!(result.tier, Tier::Warm);
        assert!(result.promoted);
        // Promoted into hot.
        assert_eq!(hot.get_object(&oid(1)).unwrap(), Some(b"warm-data".to_vec()));
    }

    #[test]
    fn missing_everywhere_returns_none() {
        let hot = HotStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let warm = PackStorage::new(FsBlobStore::open(dir.path()).unwrap());
        let cold = NullColdBackend;
        let tracker = AccessTracker::new(60.0);
        let reader = TieredReader::new(
            &hot,
            &warm,
            &cold,
            PromotionPolicy::None,
            MigrationPolicy::default(),
            &tracker,
        );
        assert!(reader.read(&oid(9)).unwrap().is_none());
    }

    #[test]
    fn conservative_policy_respects_size_threshold() {
        let hot = HotStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let warm = PackStorage::new(FsBlobStore::open(dir.path()).unwrap());
        warm.upload_pack("p1", b"warm-data", b"", 1).unwrap();
        let index = ObjectIndex::new(&hot);
        index
            .record(
                &oid(1),
                &Location { tier: Tier::Warm, pack_id: Some("p1".into()), offset: Some(0), size: 9, object_type: 3 },
            )
            .unwrap();
        let cold = NullColdBackend;
        let tracker = AccessTracker::new(60.0);
        // Score already above threshold, but size exceeds max_hot_bytes: no promotion.
        tracker.record_access(oid(1), 0.0, 0.0);
        tracker.record_access(oid(1), 0.0, 0.0);
        let policy = MigrationPolicy {
            max_hot_bytes: 4,
            min_access_count: 1.0,
            ..MigrationPolicy::default()
        };
        let reader = TieredReader::new(&hot, &warm, &cold, PromotionPolicy::Conservative, policy, &tracker);
        let result = reader.read(&oid(1)).unwrap().unwrap();
        assert!(!result.promoted);
        assert_eq!(hot.get_object(&oid(1)).unwrap(), None);
    }

    #[test]
    fn conservative_policy_promotes_once_access_threshold_is_met() {
        let hot = HotStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let warm = PackStorage::new(FsBlobStore::open(dir.path()).unwrap());
        warm.upload_pack("p1", b"warm-data", b"", 1).unwrap();
        let index = ObjectIndex::new(&hot);
        index
            .record(
                &oid(1),
                &Location { tier: Tier::Warm, pack_id: Some("p1".into()), offset: Some(0), size: 9, object_type: 3 },
            )
            .unwrap();
        let cold = NullColdBackend;
        let tracker = AccessTracker::new(60.0);
        let policy = MigrationPolicy {
            max_hot_bytes: 1024,
            min_access_count: 2.0,
            ..MigrationPolicy::default()
        };
        let reader = TieredReader::new(&hot, &warm, &cold, PromotionPolicy::Conservative, policy, &tracker);

        // First access: score 1.0, below the threshold of 2.0.
        tracker.record_access(oid(1), 0.0, 0.0);
        let result = reader.read(&oid(1)).unwrap().unwrap();
        assert!(!result.promoted);
        assert_eq!(hot.get_object(&oid(1)).unwrap(), None);

        // Second access: score 2.0, meets the threshold.
        tracker.record_access(oid(1), 0.0, 0.0);
        let result = reader.read(&oid(1)).unwrap().unwrap();
        assert!(result.promoted);
        assert_eq!(hot.get_object(&oid(1)).unwrap(), Some(b"warm-data".to_vec()));
    }
}
