//! Tier migrator (C10): moves objects between hot/warm/cold following a
//! copy-verify-swap-delete protocol so a crash mid-migration never loses
//! an object or exposes a torn read.
//!
//! `migrate_hot_to_warm` is the literal nine-step sequence:
//! 1. acquire an exclusive lock on the object id, bounded by `lock_timeout`
//! 2. re-check its current location (another actor may have already moved it)
//! 3. read the object from its source tier
//! 4. if `verify_checksum`, compute a SHA-256 checksum of the bytes read
//! 5. write the object to the target tier
//! 6. if `verify_checksum`, re-read from target and verify; roll back on mismatch
//! 7. update the object-location index to point at the target
//! 8. delete the object from the source tier
//! 9. release the lock
//!
//! Access tracking (`AccessTracker`) feeds the policy that decides which
//! objects are hot/cold candidates in the first place.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use git_hash::ObjectId;

use crate::blob_store::BlobStore;
use crate::hot_store::HotStore;
use crate::object_index::{Location, ObjectIndex};
use crate::pack_storage::PackStorage;
use crate::{StorageError, Tier};

/// Source or destination of a single-object migration.
pub enum TierHandle<'a, B: BlobStore> {
    Hot(&'a HotStore),
    Warm(&'a PackStorage<B>, &'a str),
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Per-call migration options.
#[derive(Debug, Clone, Copy)]
pub struct MigrateOptions {
    /// Compute and verify a SHA-256 checksum across the copy (steps 4/6).
    pub verify_checksum: bool,
    /// Bound on how long step 1's lock acquisition will retry before
    /// giving up with `LockTimeout`.
    pub lock_timeout: Duration,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a single migration call.
#[derive(Debug, Clone, Default)]
pub struct MigrationResult {
    pub success: bool,
    pub skipped: bool,
    pub rolled_back: bool,
    pub checksum_verified: bool,
    pub error: Option<String>,
}

impl MigrationResult {
    fn success(checksum_verified: bool) -> Self {
        Self {
            success: true,
            checksum_verified,
            ..Default::default()
        }
    }

    fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Default::default()
        }
    }
}

/// Runs the nine-step migration protocol for one object between two
/// tier handles, using `store`'s lock table and `index` as the
/// linearization point.
pub struct Migrator<'s> {
    store: &'s HotStore,
    locks: Mutex<HashMap<ObjectId, ()>>,
}

impl<'s> Migrator<'s> {
    pub fn new(store: &'s HotStore) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the per-SHA lock, retrying with bounded backoff until
    /// `timeout` elapses.
    fn lock(&self, oid: &ObjectId, timeout: Duration) -> Result<(), StorageError> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;
        loop {
            {
                let mut locks = self.locks.lock().expect("migrator lock table poisoned");
                if !locks.contains_key(oid) {
                    locks.insert(*oid, ());
                    return Ok(());
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StorageError::LockTimeout(oid.to_hex()));
            }
            std::thread::sleep(crate::backoff_delay(attempt, 5, 100).min(remaining));
            attempt += 1;
        }
    }

    fn unlock(&self, oid: &ObjectId) {
        self.locks.lock().expect("migrator lock table poisoned").remove(oid);
    }

    /// Migrate `oid` from hot to warm storage (the common downward path
    /// exercised by the scheduler). `object_type` describes the warm
    /// destination's object type; `opts` controls checksum verification
    /// and the lock-acquisition timeout.
    pub fn migrate_hot_to_warm<B: BlobStore>(
        &self,
        oid: &ObjectId,
        pack_storage: &PackStorage<B>,
        target_pack_id: &str,
        object_type: i64,
        opts: &MigrateOptions,
    ) -> Result<MigrationResult, StorageError> {
        // Step 1: acquire lock, bounded by opts.lock_timeout.
        self.lock(oid, opts.lock_timeout)?;
        let result =
            self.migrate_hot_to_warm_locked(oid, pack_storage, target_pack_id, object_type, opts);
        // Step 9: release lock, regardless of outcome.
        self.unlock(oid);
        result
    }

    fn migrate_hot_to_warm_locked<B: BlobStore>(
        &self,
        oid: &ObjectId,
        pack_storage: &PackStorage<B>,
        target_pack_id: &str,
        object_type: i64,
        opts: &MigrateOptions,
    ) -> Result<MigrationResult, StorageError> {
        let index = ObjectIndex::new(self.store);

        // Step 2: re-check location under the lock.
        if let Some(loc) = index.lookup(oid)? {
            if loc.tier != Tier::Hot {
                info!(oid = %oid, "already migrated, skipping");
                return Ok(MigrationResult::skipped());
            }
        }

        // Step 3: read from source.
        let data = self
            .store
            .get_object(oid)?
            .ok_or_else(|| StorageError::NotFound(*oid))?;

        // Step 4: checksum, only if requested.
        let expected = opts.verify_checksum.then(|| checksum(&data));

        // Step 5: write to target.
        pack_storage.upload_pack(target_pack_id, &data, &[], 1)?;

        // Step 6: verify, only if requested.
        if let Some(expected) = &expected {
            let roundtrip = pack_storage
                .download_pack(target_pack_id)?
                .ok_or_else(|| StorageError::NotFound(*oid))?;
            let actual = checksum(&roundtrip);
            if actual != *expected {
                warn!(oid = %oid, "checksum mismatch after migration, rolling back");
                pack_storage.delete_pack(target_pack_id)?;
                return Ok(MigrationResult {
                    success: false,
                    rolled_back: true,
                    checksum_verified: false,
                    error: Some(format!(
                        "checksum mismatch for {oid}: expected {expected}, got {actual}"
                    )),
                    ..Default::default()
                });
            }
        }

        // Step 7: update index.
        index.record(
            oid,
            &Location {
                tier: Tier::Warm,
                pack_id: Some(target_pack_id.to_string()),
                offset: Some(0),
                size: data.len() as u64,
                object_type,
            },
        )?;

        // Step 8: delete from source.
        self.store.delete_object(oid)?;

        info!(oid = %oid, "migrated hot -> warm");
        Ok(MigrationResult::success(expected.is_some()))
    }
}

/// Tracks access recency/frequency with exponential decay, used to
/// identify hot and cold migration candidates without an unbounded
/// access-log table.
pub struct AccessTracker {
    scores: Mutex<HashMap<ObjectId, f64>>,
    half_life_secs: f64,
}

impl AccessTracker {
    pub fn new(half_life_secs: f64) -> Self {
        Self {
            scores: Mutex::new(HashMap::new()),
            half_life_secs,
        }
    }

    fn decay_factor(&self, elapsed_secs: f64) -> f64 {
        0.5f64.powf(elapsed_secs / self.half_life_secs)
    }

    pub fn record_access(&self, oid: ObjectId, now_secs: f64, last_update_secs: f64) {
        let mut scores = self.scores.lock().expect("access tracker poisoned");
        let decayed = scores.get(&oid).copied().unwrap_or(0.0)
            * self.decay_factor((now_secs - last_update_secs).max(0.0));
        scores.insert(oid, decayed + 1.0);
    }

    pub fn score(&self, oid: &ObjectId) -> f64 {
        self.scores.lock().expect("access tracker poisoned").get(oid).copied().unwrap_or(0.0)
    }

    /// Objects with score at or above `min_access_count`, sorted
    /// descending — candidates to keep in (or promote to) hot.
    pub fn identify_hot_objects(&self, min_access_count: f64) -> Vec<ObjectId> {
        let scores = self.scores.lock().expect("access tracker poisoned");
        let mut hot: Vec<_> = scores
            .iter()
            .filter(|(_, &score)| score >= min_access_count)
            .map(|(oid, score)| (*oid, *score))
            .collect();
        hot.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hot.into_iter().map(|(oid, _)| oid).collect()
    }

    /// Objects below `min_access_count` — candidates for demotion.
    pub fn identify_cold_objects(&self, min_access_count: f64) -> Vec<ObjectId> {
        let scores = self.scores.lock().expect("access tracker poisoned");
        scores
            .iter()
            .filter(|(_, &score)| score < min_access_count)
            .map(|(oid, _)| *oid)
            .collect()
    }
}

/// Policy knobs governing when the scheduler demotes hot objects.
#[derive(Debug, Clone, Copy)]
pub struct MigrationPolicy {
    pub max_age_in_hot_secs: i64,
    pub min_access_count: f64,
    pub max_hot_bytes: u64,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self {
            max_age_in_hot_secs: 3600,
            min_access_count: 2.0,
            max_hot_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Evaluates a policy against current tier stats/ages to decide whether
/// migration should run. A pure function so scheduling logic is testable
/// without a live store. A candidate must violate both the age and access
/// thresholds to demote on those grounds; the size threshold alone
/// suffices (this is also what makes demotion reachable when ages are
/// effectively `+∞`, i.e. age-based demotion is disabled).
pub fn should_demote(policy: &MigrationPolicy, age_secs: i64, access_score: f64, hot_bytes: u64) -> bool {
    (age_secs >= policy.max_age_in_hot_secs && access_score < policy.min_access_count)
        || hot_bytes > policy.max_hot_bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::FsBlobStore;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::Sha1([byte; 20])
    }

    #[test]
    fn migrate_hot_to_warm_moves_object_and_updates_index() {
        let store = HotStore::open_in_memory().unwrap();
        store.put_object(&oid(1), 3, b"content", 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pack_storage = PackStorage::new(FsBlobStore::open(dir.path()).unwrap());
        let migrator = Migrator::new(&store);

        let result = migrator
            .migrate_hot_to_warm(&oid(1), &pack_storage, "pack-1", 3, &MigrateOptions::default())
            .unwrap();
        assert!(result.success);
        assert!(!result.skipped);
        assert!(result.checksum_verified);

        assert_eq!(store.get_object(&oid(1)).unwrap(), None);
        let index = ObjectIndex::new(&store);
        let loc = index.lookup(&oid(1)).unwrap().unwrap();
        assert_eq!(loc.tier, Tier::Warm);
        assert_eq!(loc.pack_id.as_deref(), Some("pack-1"));
    }

    #[test]
    fn migrate_without_verify_checksum_skips_roundtrip_check() {
        let store = HotStore::open_in_memory().unwrap();
        store.put_object(&oid(1), 3, b"content", 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pack_storage = PackStorage::new(FsBlobStore::open(dir.path()).unwrap());
        let migrator = Migrator::new(&store);
        let opts = MigrateOptions {
            verify_checksum: false,
            ..Default::default()
        };

        let result = migrator
            .migrate_hot_to_warm(&oid(1), &pack_storage, "pack-1", 3, &opts)
            .unwrap();
        assert!(result.success);
        assert!(!result.checksum_verified);
    }

    #[test]
    fn migrate_missing_object_errors() {
        let store = HotStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pack_storage = PackStorage::new(FsBlobStore::open(dir.path()).unwrap());
        let migrator = Migrator::new(&store);
        assert!(matches!(
            migrator.migrate_hot_to_warm(&oid(9), &pack_storage, "p", 3, &MigrateOptions::default()),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn already_migrated_object_is_skipped_idempotently() {
        let store = HotStore::open_in_memory().unwrap();
        store.put_object(&oid(1), 3, b"content", 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pack_storage = PackStorage::new(FsBlobStore::open(dir.path()).unwrap());
        let migrator = Migrator::new(&store);
        migrator
            .migrate_hot_to_warm(&oid(1), &pack_storage, "pack-1", 3, &MigrateOptions::default())
            .unwrap();
        // Second call: index already says warm, so it's a skip rather than a NotFound error.
        let result = migrator
            .migrate_hot_to_warm(&oid(1), &pack_storage, "pack-1", 3, &MigrateOptions::default())
            .unwrap();
        assert!(result.success);
        assert!(result.skipped);
    }

    #[test]
    fn lock_held_by_another_caller_times_out() {
        let store = HotStore::open_in_memory().unwrap();
        store.put_object(&oid(1), 3, b"content", 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pack_storage = PackStorage::new(FsBlobStore::open(dir.path()).unwrap());
        let migrator = Migrator::new(&store);
        migrator.lock(&oid(1), Duration::from_secs(5)).unwrap();

        let opts = MigrateOptions {
            lock_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        assert!(matches!(
            migrator.migrate_hot_to_warm(&oid(1), &pack_storage, "pack-1", 3, &opts),
            Err(StorageError::LockTimeout(_))
        ));
    }

    #[test]
    fn access_tracker_identifies_hot_and_cold() {
        let tracker = AccessTracker::new(60.0);
        tracker.record_access(oid(1), 0.0, 0.0);
        tracker.record_access(oid(1), 1.0, 0.0);
        tracker.record_access(oid(2), 0.0, 0.0);

        let hot = tracker.identify_hot_objects(1.5);
        assert_eq!(hot, vec![oid(1)]);
        let cold = tracker.identify_cold_objects(1.5);
        assert_eq!(cold, vec![oid(2)]);
    }

    #[test]
    fn should_demote_requires_age_and_access_together() {
        let policy = MigrationPolicy::default();
        // Old but still frequently accessed: not a demotion candidate.
        assert!(!should_demote(&policy, policy.max_age_in_hot_secs + 1, 10.0, 0));
        // Old and infrequently accessed: demote.
        assert!(should_demote(&policy, policy.max_age_in_hot_secs + 1, 0.0, 0));
        // Young but infrequently accessed: age threshold not violated, don't demote.
        assert!(!should_demote(&policy, 0, 0.0, 0));
        // Size threshold alone suffices regardless of age/access.
        assert!(should_demote(&policy, 0, 10.0, policy.max_hot_bytes + 1));
        assert!(!should_demote(&policy, 0, 10.0, 0));
    }
}
