//! Hot store (C7): the embedded SQL store backing the `hot` tier.
//!
//! Recently-written or frequently-read objects live here as rows rather
//! than packed blobs, trading space for write and random-read latency.
//! The schema also hosts the WAL (`wal_entries`, `transactions`,
//! `checkpoints`) and the object-location index (`object_index`) used by
//! the other modules in this crate, since all of them need the same
//! crash-consistency guarantees a single SQLite connection gives for free.

use std::path::Path;

use rusqlite::Connection;

use git_hash::ObjectId;

use crate::StorageError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS hot_objects (
    oid         TEXT PRIMARY KEY,
    object_type INTEGER NOT NULL,
    size        INTEGER NOT NULL,
    data        BLOB NOT NULL,
    created_at  INTEGER NOT NULL,
    last_access INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS object_index (
    oid    TEXT PRIMARY KEY,
    tier   TEXT NOT NULL,
    pack_id TEXT,
    offset  INTEGER,
    size    INTEGER NOT NULL,
    object_type INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS wal_entries (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id      INTEGER NOT NULL,
    payload    BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    flushed    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS transactions (
    tx_id   INTEGER PRIMARY KEY,
    state   TEXT NOT NULL,
    started_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    up_to_seq    INTEGER NOT NULL,
    created_at   INTEGER NOT NULL
);
"#;

/// A handle on the hot store's SQLite connection. Wraps the schema
/// migration and gives other modules in this crate (`wal`, `object_index`)
/// a shared connection without duplicating `PRAGMA`/schema setup.
pub struct HotStore {
    conn: Connection,
}

impl HotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn put_object(
        &self,
        oid: &ObjectId,
        object_type: i64,
        data: &[u8],
        now: i64,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO hot_objects (oid, object_type, size, data, created_at, last_access, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0)
             ON CONFLICT(oid) DO UPDATE SET data = excluded.data, size = excluded.size",
            rusqlite::params![oid.to_hex(), object_type, data.len() as i64, data, now],
        )?;
        Ok(())
    }

    pub fn get_object(&self, oid: &ObjectId) -> Result<Option<Vec<u8>>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM hot_objects WHERE oid = ?1")?;
        let mut rows = stmt.query(rusqlite::params![oid.to_hex()])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub fn touch_object(&self, oid: &ObjectId, now: i64) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE hot_objects SET last_access = ?2, access_count = access_count + 1 WHERE oid = ?1",
            rusqlite::params![oid.to_hex(), now],
        )?;
        Ok(())
    }

    pub fn delete_object(&self, oid: &ObjectId) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM hot_objects WHERE oid = ?1", rusqlite::params![oid.to_hex()])?;
        Ok(())
    }

    /// Objects whose `last_access` is older than `cutoff`, ordered coldest
    /// first. Feeds the migrator's cold-object identification pass.
    pub fn stale_objects(&self, cutoff: i64, limit: u32) -> Result<Vec<ObjectId>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT oid FROM hot_objects WHERE last_access < ?1 ORDER BY last_access ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![cutoff, limit], |row| {
            let hex: String = row.get(0)?;
            Ok(hex)
        })?;
        let mut out = Vec::new();
        for hex in rows {
            let hex = hex?;
            out.push(ObjectId::from_hex(&hex)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::Sha1([byte; 20])
    }

    #[test]
    fn put_get_roundtrip() {
        let store = HotStore::open_in_memory().unwrap();
        store.put_object(&oid(1), 3, b"blobdata", 100).unwrap();
        assert_eq!(store.get_object(&oid(1)).unwrap(), Some(b"blobdata".to_vec()));
    }

    #[test]
    fn missing_object_is_none() {
        let store = HotStore::open_in_memory().unwrap();
        assert_eq!(store.get_object(&oid(9)).unwrap(), None);
    }

    #[test]
    fn touch_increments_access_count_and_stale_query_respects_cutoff() {
        let store = HotStore::open_in_memory().unwrap();
        store.put_object(&oid(1), 3, b"x", 10).unwrap();
        store.touch_object(&oid(1), 20).unwrap();
        let stale = store.stale_objects(15, 10).unwrap();
        assert!(stale.is_empty());
        let stale = store.stale_objects(25, 10).unwrap();
        assert_eq!(stale, vec![oid(1)]);
    }

    #[test]
    fn delete_removes_row() {
        let store = HotStore::open_in_memory().unwrap();
        store.put_object(&oid(1), 3, b"x", 10).unwrap();
        store.delete_object(&oid(1)).unwrap();
        assert_eq!(store.get_object(&oid(1)).unwrap(), None);
    }
}
