//! In-memory identity store for tests and embedders without a disk.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use visitor_core::{IdentityRecord, StorageError};

use crate::{ensure_present, IdentityStore};

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    record: RwLock<Option<IdentityRecord>>,
    saves: AtomicUsize,
    clears: AtomicUsize,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `record`.
    pub fn with_record(record: IdentityRecord) -> Self {
        Self {
            record: RwLock::new(Some(record)),
            ..Self::default()
        }
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of `clear` calls.
    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<IdentityRecord>, StorageError> {
        let record = self.record.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(record.clone().filter(IdentityRecord::is_present))
    }

    fn save(&self, record: &IdentityRecord) -> Result<(), StorageError> {
        ensure_present(record)?;
        let mut slot = self.record.write().map_err(|_| StorageError::LockPoisoned)?;
        *slot = Some(record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut slot = self.record.write().map_err(|_| StorageError::LockPoisoned)?;
        *slot = None;
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// The store only ever holds the most recent successful save.
        #[test]
        fn prop_last_save_wins(ids in prop::collection::vec("[a-zA-Z0-9]{0,12}", 1..10)) {
            let store = MemoryIdentityStore::new();
            let mut expected = None;
            for id in &ids {
                let record = IdentityRecord::from_override(id.clone());
                if store.save(&record).is_ok() {
                    expected = Some(record);
                }
            }
            prop_assert_eq!(store.load().unwrap(), expected);
        }
    }
}
