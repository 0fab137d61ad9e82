//! Cold-tier contract (C11 dependency). The cold tier is an external,
//! operator-provided backend (archival object storage, a data lake, etc.);
//! this crate only defines the contract a tiered reader needs and ships a
//! null implementation for tests and for deployments that never demote
//! objects past `warm`.

use git_hash::ObjectId;

use crate::StorageError;

/// A filter describing which cold-tier objects to enumerate. Left
/// deliberately coarse since cold backends vary widely in query
/// capability; a richer query language is an operator-specific add-on.
#[derive(Debug, Clone, Default)]
pub struct ColdQuery {
    pub object_type: Option<i64>,
    pub limit: Option<u32>,
}

pub trait ColdBackend: Send + Sync {
    fn get(&self, oid: &ObjectId) -> Result<Option<Vec<u8>>, StorageError>;
    fn query(&self, filter: &ColdQuery) -> Result<Vec<ObjectId>, StorageError>;
}

/// A cold backend that holds nothing. Useful as the default when an
/// operator hasn't wired in a real archival store, and in tests of the
/// hot/warm migration path that never reach the cold tier.
pub struct NullColdBackend;

impl ColdBackend for NullColdBackend {
    fn get(&self, _oid: &ObjectId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(None)
    }

    fn query(&self, _filter: &ColdQuery) -> Result<Vec<ObjectId>, StorageError> {
        Ok(Vec::new())
    }
}
