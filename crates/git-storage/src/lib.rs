//! Tiered object storage: the durability and migration layer sitting under
//! the pack/object model.
//!
//! A repository's objects live in one of three tiers — `hot` (rows in the
//! embedded SQL store), `warm` (packed blobs in the blob store), and `cold`
//! (an external, contract-only backend) — and move between them under a
//! migration policy driven by access frequency and age. A write-ahead log
//! makes hot-store mutations crash-safe; an object-location index routes
//! reads to the tier currently holding each object.

pub mod blob_store;
pub mod cold;
pub mod hot_store;
pub mod migrator;
pub mod object_index;
pub mod pack_storage;
pub mod tiered_reader;
pub mod wal;

use git_hash::ObjectId;

/// Storage tier an object currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "hot" => Some(Tier::Hot),
            "warm" => Some(Tier::Warm),
            "cold" => Some(Tier::Cold),
            _ => None,
        }
    }
}

/// Errors surfaced by the storage layer, matching the taxonomy in the
/// error-handling design: lock contention, optimistic-concurrency
/// conflicts, checksum verification failures, transaction-state errors,
/// and cancellation/timeout.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("lock busy for key: {0}")]
    LockBusy(String),

    #[error("lock acquisition timed out for key: {0}")]
    LockTimeout(String),

    #[error("conditional write conflict on key: {0}")]
    Conflict(String),

    #[error("checksum mismatch for {oid}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        oid: ObjectId,
        expected: String,
        actual: String,
    },

    #[error("transaction not found: {0}")]
    TxNotFound(u64),

    #[error("transaction not active: {0}")]
    TxNotActive(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hash(#[from] git_hash::HashError),
}

/// Bounded exponential backoff with jitter, used by callers retrying
/// `LockBusy`/`Conflict` errors and by the migrator's lock acquisition.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> std::time::Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(max_ms);
    // Deterministic jitter derived from the attempt number (no RNG dependency
    // at this layer — callers that need real jitter can perturb `attempt`).
    let jitter = (attempt as u64 * 37) % (capped / 4 + 1);
    std::time::Duration::from_millis(capped.saturating_sub(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trip() {
        for t in [Tier::Hot, Tier::Warm, Tier::Cold] {
            assert_eq!(Tier::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn backoff_is_bounded() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt, 10, 1000);
            assert!(d.as_millis() <= 1000);
        }
    }
}
