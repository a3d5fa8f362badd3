//! JSON file store.
//!
//! Writes land in a sibling temporary file which is flushed to disk and then
//! renamed over the target, so a crash leaves either the old or the new
//! document in place.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use visitor_core::{IdentityRecord, StorageError};

use crate::{decode, encode, ensure_present, IdentityStore};

/// Identity store backed by a single JSON document.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    /// Serializes writers so temp files are never shared.
    write_lock: Mutex<()>,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("identity"));
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, e: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<IdentityRecord>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(decode(&bytes, "file")),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn save(&self, record: &IdentityRecord) -> Result<(), StorageError> {
        ensure_present(record)?;
        let bytes = encode(record)?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let temp = self.temp_path();
        let mut file = File::create(&temp).map_err(|e| self.io_error(e))?;
        file.write_all(&bytes).map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;
        drop(file);

        fs::rename(&temp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;

        for path in [self.path.clone(), self.temp_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(self.io_error(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn create_test_store() -> (FileIdentityStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = FileIdentityStore::new(temp_dir.path().join("nested").join("visitor.json"));
        (store, temp_dir)
    }

    fn sample_record() -> IdentityRecord {
        IdentityRecord::from_service("ecid", 100, 6, "blob")
            .with_data_provider(1234)
            .with_next_refresh_at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_load_missing_file_is_absent() {
        let (store, _temp_dir) = create_test_store();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let (store, _temp_dir) = create_test_store();
        let record = sample_record();

        store.save(&record).unwrap();
        assert_eq!(store.load().unwrap(), Some(record));
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_save_replaces_whole_record() {
        let (store, _temp_dir) = create_test_store();
        store.save(&sample_record()).unwrap();

        let replacement = IdentityRecord::from_override("other");
        store.save(&replacement).unwrap();
        assert_eq!(store.load().unwrap(), Some(replacement));
    }

    #[test]
    fn test_clear_removes_record() {
        let (store, _temp_dir) = create_test_store();
        store.save(&sample_record()).unwrap();

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[test]
    fn test_save_rejects_empty_id() {
        let (store, _temp_dir) = create_test_store();
        let err = store.save(&IdentityRecord::from_override("")).unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord { .. }));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_truncated_document_loads_as_absent() {
        let (store, _temp_dir) = create_test_store();
        store.save(&sample_record()).unwrap();

        let bytes = fs::read(store.path()).unwrap();
        fs::write(store.path(), &bytes[..bytes.len() / 2]).unwrap();

        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_leftover_temp_file_does_not_affect_load() {
        let (store, _temp_dir) = create_test_store();
        let record = sample_record();
        store.save(&record).unwrap();

        // Simulate a crash mid-write of the next record.
        fs::write(store.temp_path(), b"{\"id\":\"half").unwrap();
        assert_eq!(store.load().unwrap(), Some(record));
    }
}
