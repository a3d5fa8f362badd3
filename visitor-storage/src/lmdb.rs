//! LMDB-backed identity store.
//!
//! Uses the heed crate (Rust bindings for LMDB). The record lives under a
//! single key in the unnamed database; LMDB write transactions make each
//! replacement atomic.

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use visitor_core::{IdentityRecord, StorageError};

use crate::{decode, encode, ensure_present, IdentityStore};

/// Key under which the current record is stored.
const RECORD_KEY: &[u8] = b"visitor.identity";

/// Map size for the environment; the record is a few hundred bytes.
const DEFAULT_MAP_SIZE_MB: usize = 1;

fn lmdb_error(e: heed::Error) -> StorageError {
    StorageError::Lmdb {
        reason: e.to_string(),
    }
}

/// Identity store backed by an LMDB environment.
pub struct LmdbIdentityStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbIdentityStore {
    /// Open (or create) an environment in `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_size(path, DEFAULT_MAP_SIZE_MB)
    }

    pub fn open_with_size<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
    ) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&path).map_err(|e| StorageError::Io {
            path: path.as_ref().display().to_string(),
            reason: e.to_string(),
        })?;

        // SAFETY: the environment is opened once per store and the directory
        // is not shared with other processes mapping it differently.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(lmdb_error)?;

        let mut wtxn = env.write_txn().map_err(lmdb_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(lmdb_error)?;
        wtxn.commit().map_err(lmdb_error)?;

        Ok(Self { env, db })
    }
}

impl IdentityStore for LmdbIdentityStore {
    fn load(&self) -> Result<Option<IdentityRecord>, StorageError> {
        let rtxn = self.env.read_txn().map_err(lmdb_error)?;
        let bytes = self.db.get(&rtxn, RECORD_KEY).map_err(lmdb_error)?;
        Ok(bytes.and_then(|bytes| decode(bytes, "lmdb")))
    }

    fn save(&self, record: &IdentityRecord) -> Result<(), StorageError> {
        ensure_present(record)?;
        let bytes = encode(record)?;

        let mut wtxn = self.env.write_txn().map_err(lmdb_error)?;
        self.db
            .put(&mut wtxn, RECORD_KEY, &bytes)
            .map_err(lmdb_error)?;
        wtxn.commit().map_err(lmdb_error)
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_error)?;
        self.db.delete(&mut wtxn, RECORD_KEY).map_err(lmdb_error)?;
        wtxn.commit().map_err(lmdb_error)
    }
}

impl std::fmt::Debug for LmdbIdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbIdentityStore")
            .field("path", &self.env.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbIdentityStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbIdentityStore::open(temp_dir.path()).expect("store creation should succeed");
        (store, temp_dir)
    }

    #[test]
    fn test_empty_store_loads_nothing() {
        let (store, _temp_dir) = create_test_store();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let (store, _temp_dir) = create_test_store();
        let record = IdentityRecord::from_service("ecid", 600, 3, "blob").with_data_provider(7);

        store.save(&record).unwrap();
        assert_eq!(store.load().unwrap(), Some(record));
    }

    #[test]
    fn test_clear_removes_record() {
        let (store, _temp_dir) = create_test_store();
        store.save(&IdentityRecord::from_override("ecid")).unwrap();

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_record_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let record = IdentityRecord::from_override("persisted");
        {
            let store = LmdbIdentityStore::open(temp_dir.path()).unwrap();
            store.save(&record).unwrap();
        }
        let store = LmdbIdentityStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), Some(record));
    }
}
