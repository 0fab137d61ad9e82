//! Object-location index (C9): maps each object's id to the tier (and,
//! for `warm`, the pack/offset) currently holding it. Every tier-crossing
//! operation in the migrator updates this table as its last durable step,
//! so lookups never observe a half-migrated object.

use rusqlite::{params, OptionalExtension};

use git_hash::ObjectId;

use crate::hot_store::HotStore;
use crate::{StorageError, Tier};

/// Where an object currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub tier: Tier,
    pub pack_id: Option<String>,
    pub offset: Option<u64>,
    pub size: u64,
    pub object_type: i64,
}

/// Aggregate counts, used by the migrator to decide whether the hot tier
/// has exceeded its size budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub hot_count: u64,
    pub warm_count: u64,
    pub cold_count: u64,
    pub hot_bytes: u64,
}

pub struct ObjectIndex<'a> {
    store: &'a HotStore,
}

impl<'a> ObjectIndex<'a> {
    pub fn new(store: &'a HotStore) -> Self {
        Self { store }
    }

    pub fn record(&self, oid: &ObjectId, loc: &Location) -> Result<(), StorageError> {
        self.store.connection().execute(
            "INSERT INTO object_index (oid, tier, pack_id, offset, size, object_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(oid) DO UPDATE SET
                tier = excluded.tier, pack_id = excluded.pack_id,
                offset = excluded.offset, size = excluded.size,
                object_type = excluded.object_type",
            params![
                oid.to_hex(),
                loc.tier.as_str(),
                loc.pack_id,
                loc.offset.map(|o| o as i64),
                loc.size as i64,
                loc.object_type,
            ],
        )?;
        Ok(())
    }

    pub fn lookup(&self, oid: &ObjectId) -> Result<Option<Location>, StorageError> {
        self.store
            .connection()
            .query_row(
                "SELECT tier, pack_id, offset, size, object_type FROM object_index WHERE oid = ?1",
                params![oid.to_hex()],
                |row| {
                    let tier_str: String = row.get(0)?;
                    Ok(Location {
                        tier: Tier::from_str(&tier_str).unwrap_or(Tier::Cold),
                        pack_id: row.get(1)?,
                        offset: row.get::<_, Option<i64>>(2)?.map(|o| o as u64),
                        size: row.get::<_, i64>(3)? as u64,
                        object_type: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(StorageError::from)
    }

    pub fn batch_lookup(&self, oids: &[ObjectId]) -> Result<Vec<Option<Location>>, StorageError> {
        oids.iter().map(|oid| self.lookup(oid)).collect()
    }

    pub fn remove(&self, oid: &ObjectId) -> Result<(), StorageError> {
        self.store
            .connection()
            .execute("DELETE FROM object_index WHERE oid = ?1", params![oid.to_hex()])?;
        Ok(())
    }

    pub fn stats(&self) -> Result<TierStats, StorageError> {
        let mut stats = TierStats::default();
        let mut stmt = self
            .store
            .connection()
            .prepare("SELECT tier, COUNT(*), COALESCE(SUM(size), 0) FROM object_index GROUP BY tier")?;
        let rows = stmt.query_map([], |row| {
            let tier: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let bytes: i64 = row.get(2)?;
            Ok((tier, count as u64, bytes as u64))
        })?;
        for row in rows {
            let (tier, count, bytes) = row?;
            match Tier::from_str(&tier) {
                Some(Tier::Hot) => {
                    stats.hot_count = count;
                    stats.hot_bytes = bytes;
                }
                Some(Tier::Warm) => stats.warm_count = count,
                Some(Tier::Cold) => stats.cold_count = count,
                None => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::Sha1([byte; 20])
    }

    #[test]
    fn record_and_lookup_roundtrip() {
        let store = HotStore::open_in_memory().unwrap();
        let index = ObjectIndex::new(&store);
        let loc = Location {
            tier: Tier::Warm,
            pack_id: Some("p1".into()),
            offset: Some(128),
            size: 64,
            object_type: 3,
        };
        index.record(&oid(1), &loc).unwrap();
        assert_eq!(index.lookup(&oid(1)).unwrap(), Some(loc));
    }

    #[test]
    fn lookup_missing_is_none() {
        let store = HotStore::open_in_memory().unwrap();
        let index = ObjectIndex::new(&store);
        assert_eq!(index.lookup(&oid(9)).unwrap(), None);
    }

    #[test]
    fn re_record_updates_tier() {
        let store = HotStore::open_in_memory().unwrap();
        let index = ObjectIndex::new(&store);
        let hot = Location {
            tier: Tier::Hot,
            pack_id: None,
            offset: None,
            size: 10,
            object_type: 3,
        };
        index.record(&oid(1), &hot).unwrap();
        let warm = Location {
            tier: Tier::Warm,
            pack_id: Some("p1".into()),
            offset: Some(0),
            size: 10,
            object_type: 3,
        };
        index.record(&oid(1), &warm).unwrap();
        assert_eq!(index.lookup(&oid(1)).unwrap(), Some(warm));
    }

    #[test]
    fn stats_aggregate_by_tier() {
        let store = HotStore::open_in_memory().unwrap();
        let index = ObjectIndex::new(&store);
        index
            .record(
                &oid(1),
                &Location { tier: Tier::Hot, pack_id: None, offset: None, size: 10, object_type: 3 },
            )
            .unwrap();
        index
            .record(
                &oid(2),
                &Location { tier: Tier::Warm, pack_id: Some("p".into()), offset: Some(0), size: 20, object_type: 3 },
            )
            .unwrap();
        let stats = index.stats().unwrap();
        assert_eq!(stats.hot_count, 1);
        assert_eq!(stats.hot_bytes, 10);
        assert_eq!(stats.warm_count, 1);
    }
}
