//! In-memory record backend.
//!
//! Process-lifetime only: everything is lost when the backend is dropped.

use std::collections::BTreeMap;
use std::sync::RwLock;

use e2ee_crypto::EncryptedPickleKey;

use super::backend::{validate, BackendError, RecordBackend, RecordKey, RecordType, Result, StoredRecord};

/// Records held in a `BTreeMap` behind a lock.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<RecordKey, Vec<u8>>>,
    pickle_key: RwLock<Option<EncryptedPickleKey>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock was poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.records.read().map_err(|_| BackendError::Poisoned)?.len())
    }

    /// Whether nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock was poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl RecordBackend for MemoryBackend {
    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>> {
        let records = self.records.read().map_err(|_| BackendError::Poisoned)?;
        Ok(records.get(key).cloned())
    }

    fn scan(&self, record_type: RecordType, owner: Option<&str>) -> Result<Vec<StoredRecord>> {
        let records = self.records.read().map_err(|_| BackendError::Poisoned)?;
        Ok(records
            .iter()
            .filter(|(key, _)| key.record_type == record_type)
            .filter(|(key, _)| owner.is_none_or(|owner| key.owner == owner))
            .map(|(key, value)| StoredRecord {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    fn write_batch(&self, batch: Vec<StoredRecord>) -> Result<()> {
        // Validate everything first so a bad record leaves the map untouched.
        for record in &batch {
            validate(record)?;
        }

        let mut records = self.records.write().map_err(|_| BackendError::Poisoned)?;
        for record in batch {
            records.insert(record.key, record.value);
        }
        Ok(())
    }

    fn load_pickle_key(&self) -> Result<Option<EncryptedPickleKey>> {
        Ok(self
            .pickle_key
            .read()
            .map_err(|_| BackendError::Poisoned)?
            .clone())
    }

    fn save_pickle_key(&self, key: &EncryptedPickleKey) -> Result<()> {
        *self.pickle_key.write().map_err(|_| BackendError::Poisoned)? = Some(key.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str, id: &str, value: &[u8]) -> StoredRecord {
        StoredRecord {
            key: RecordKey::new(RecordType::Device, owner, id),
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_scan_filters_by_type_and_owner() {
        let backend = MemoryBackend::new();
        backend
            .write_batch(vec![
                record("alice", "A", b"1"),
                record("alice", "B", b"2"),
                record("bob", "C", b"3"),
                StoredRecord {
                    key: RecordKey::new(RecordType::Account, "alice", "account"),
                    value: b"acct".to_vec(),
                },
            ])
            .unwrap();

        assert_eq!(backend.scan(RecordType::Device, None).unwrap().len(), 3);
        assert_eq!(backend.scan(RecordType::Device, Some("alice")).unwrap().len(), 2);
        assert_eq!(backend.scan(RecordType::Account, None).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_record_rejects_whole_batch() {
        let backend = MemoryBackend::new();
        let result = backend.write_batch(vec![record("alice", "A", b"1"), record("", "B", b"2")]);

        assert!(matches!(result, Err(BackendError::Invalid(_))));
        assert!(backend.is_empty().unwrap());
    }
}
