//! Write-ahead log (C8) over the hot store's `wal_entries`/`transactions`/
//! `checkpoints` tables: append-only durability for hot-tier mutations,
//! with explicit transaction boundaries and checkpoint-based truncation.
//!
//! Recovery is driven by the `flushed` flag on `wal_entries`, not by
//! transaction state: `recover` returns every unflushed entry in ascending
//! sequence order regardless of whether its transaction has committed, so
//! a crash before commit still replays cleanly (re-running `recover` is
//! always safe). Rollback deletes its transaction's entries outright, so
//! they never show up as unflushed in the first place.

use rusqlite::{params, OptionalExtension};

use crate::hot_store::HotStore;
use crate::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    Aborted,
}

impl TxState {
    fn as_str(&self) -> &'static str {
        match self {
            TxState::Open => "open",
            TxState::Committed => "committed",
            TxState::Aborted => "aborted",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(TxState::Open),
            "committed" => Some(TxState::Committed),
            "aborted" => Some(TxState::Aborted),
            _ => None,
        }
    }
}

/// A single WAL entry recovered from the log.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub seq: i64,
    pub tx_id: i64,
    pub payload: Vec<u8>,
}

pub struct Wal<'a> {
    store: &'a HotStore,
}

impl<'a> Wal<'a> {
    pub fn new(store: &'a HotStore) -> Self {
        Self { store }
    }

    /// Begin a new transaction, returning its id.
    pub fn begin_transaction(&self, now: i64) -> Result<i64, StorageError> {
        self.store.connection().execute(
            "INSERT INTO transactions (tx_id, state, started_at)
             VALUES ((SELECT COALESCE(MAX(tx_id), 0) + 1 FROM transactions), ?1, ?2)",
            params![TxState::Open.as_str(), now],
        )?;
        Ok(self.store.connection().last_insert_rowid())
    }

    fn require_open(&self, tx_id: i64) -> Result<(), StorageError> {
        let state: Option<String> = self
            .store
            .connection()
            .query_row(
                "SELECT state FROM transactions WHERE tx_id = ?1",
                params![tx_id],
                |row| row.get(0),
            )
            .optional()?;
        match state.as_deref().and_then(TxState::from_str) {
            Some(TxState::Open) => Ok(()),
            Some(_) => Err(StorageError::TxNotActive(tx_id as u64)),
            None => Err(StorageError::TxNotFound(tx_id as u64)),
        }
    }

    /// Append one WAL entry under an open transaction.
    pub fn append(&self, tx_id: i64, payload: &[u8], now: i64) -> Result<i64, StorageError> {
        self.require_open(tx_id)?;
        self.store.connection().execute(
            "INSERT INTO wal_entries (tx_id, payload, created_at) VALUES (?1, ?2, ?3)",
            params![tx_id, payload, now],
        )?;
        Ok(self.store.connection().last_insert_rowid())
    }

    /// Mark every unflushed row flushed, returning the count marked.
    /// SQLite's own WAL-mode journal already fsyncs on commit; this is the
    /// explicit durability point the spec tracks, separate from the
    /// logical commit below, and gates which rows truncation may remove.
    pub fn flush(&self) -> Result<usize, StorageError> {
        let n = self
            .store
            .connection()
            .execute("UPDATE wal_entries SET flushed = 1 WHERE flushed = 0", [])?;
        Ok(n)
    }

    pub fn commit(&self, tx_id: i64) -> Result<(), StorageError> {
        self.require_open(tx_id)?;
        self.store.connection().execute(
            "UPDATE transactions SET state = ?2 WHERE tx_id = ?1",
            params![tx_id, TxState::Committed.as_str()],
        )?;
        Ok(())
    }

    /// Roll back a transaction: its non-begin entries are deleted before
    /// the transaction is marked aborted, per the spec's rollback ordering.
    pub fn rollback(&self, tx_id: i64) -> Result<(), StorageError> {
        self.require_open(tx_id)?;
        self.store
            .connection()
            .execute("DELETE FROM wal_entries WHERE tx_id = ?1", params![tx_id])?;
        self.store.connection().execute(
            "UPDATE transactions SET state = ?2 WHERE tx_id = ?1",
            params![tx_id, TxState::Aborted.as_str()],
        )?;
        Ok(())
    }

    /// Replay every unflushed entry, in ascending sequence order, whatever
    /// state its transaction is in. Safe to call repeatedly (pure read of
    /// immutable log state).
    pub fn recover(&self) -> Result<Vec<WalEntry>, StorageError> {
        let mut stmt = self.store.connection().prepare(
            "SELECT seq, tx_id, payload FROM wal_entries WHERE flushed = 0 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WalEntry {
                seq: row.get(0)?,
                tx_id: row.get(1)?,
                payload: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Record a checkpoint at the current maximum sequence number.
    pub fn create_checkpoint(&self, now: i64) -> Result<i64, StorageError> {
        let up_to_seq: i64 = self
            .store
            .connection()
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM wal_entries", [], |row| row.get(0))?;
        self.store.connection().execute(
            "INSERT INTO checkpoints (up_to_seq, created_at) VALUES (?1, ?2)",
            params![up_to_seq, now],
        )?;
        Ok(up_to_seq)
    }

    /// Drop flushed entries at or below the last checkpoint's sequence,
    /// along with transactions that no longer have any referencing entries.
    /// Unflushed entries are never removed, even if their seq is below the
    /// checkpoint, since they still need to be returned by `recover`.
    pub fn truncate_before_checkpoint(&self) -> Result<(), StorageError> {
        let up_to_seq: Option<i64> = self
            .store
            .connection()
            .query_row(
                "SELECT up_to_seq FROM checkpoints ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(up_to_seq) = up_to_seq {
            self.store.connection().execute(
                "DELETE FROM wal_entries WHERE seq <= ?1 AND flushed = 1",
                params![up_to_seq],
            )?;
            self.store.connection().execute(
                "DELETE FROM transactions WHERE state != ?1 AND tx_id NOT IN (SELECT DISTINCT tx_id FROM wal_entries)",
                params![TxState::Open.as_str()],
            )?;
        }
        Ok(())
    }
}
