//! Visitor Storage - Identity Store Trait and Implementations
//!
//! Persists the single identity record owned by the engine. Consumers never
//! reach a store directly; all persistence goes through the manager.

pub mod file;
pub mod lmdb;
pub mod memory;

pub use file::FileIdentityStore;
pub use lmdb::LmdbIdentityStore;
pub use memory::MemoryIdentityStore;

use visitor_core::{IdentityRecord, StorageError};

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Durable mirror of the current identity record.
///
/// Implementations must be safe for concurrent use and crash-consistent: a
/// write interrupted part way must not make the next `load()` return a
/// corrupted record.
pub trait IdentityStore: Send + Sync {
    /// Load the persisted record, if any.
    fn load(&self) -> Result<Option<IdentityRecord>, StorageError>;

    /// Replace the persisted record.
    fn save(&self, record: &IdentityRecord) -> Result<(), StorageError>;

    /// Remove any persisted record.
    fn clear(&self) -> Result<(), StorageError>;
}

/// Reject records that must never be persisted.
pub(crate) fn ensure_present(record: &IdentityRecord) -> Result<(), StorageError> {
    if record.is_present() {
        Ok(())
    } else {
        Err(StorageError::InvalidRecord {
            reason: "identity id is empty".to_string(),
        })
    }
}

pub(crate) fn encode(record: &IdentityRecord) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(record).map_err(|e| StorageError::Serialization {
        reason: e.to_string(),
    })
}

/// Decode a persisted record. Unreadable or id-less payloads are treated as
/// absent.
pub(crate) fn decode(bytes: &[u8], source: &str) -> Option<IdentityRecord> {
    match serde_json::from_slice::<IdentityRecord>(bytes) {
        Ok(record) if record.is_present() => Some(record),
        Ok(_) => {
            tracing::warn!(source, "Discarding persisted identity with empty id");
            None
        }
        Err(e) => {
            tracing::warn!(source, error = %e, "Discarding unreadable persisted identity");
            None
        }
    }
}
