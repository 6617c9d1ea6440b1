use super::{ArtifactKey, ArtifactStore, ArtifactValue, WriteOutcome};
use crate::errors::StoreError;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// In-process artifact store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<ArtifactKey, ArtifactValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryStore {
    fn exists(&self, keys: &[ArtifactKey]) -> Result<bool, StoreError> {
        // One read guard for the whole set.
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(keys.iter().all(|k| entries.contains_key(k)))
    }

    fn write(&self, key: &ArtifactKey, value: &ArtifactValue) -> Result<WriteOutcome, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        if entries.contains_key(key) {
            return Ok(WriteOutcome::AlreadyPresent);
        }
        entries.insert(key.clone(), value.clone());
        Ok(WriteOutcome::Created)
    }

    fn read(&self, key: &ArtifactKey) -> Result<ArtifactValue, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        entries.get(key).cloned().ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })
    }

    fn keys(&self, prefix: &str) -> Result<Vec<ArtifactKey>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
