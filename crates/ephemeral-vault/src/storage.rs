//! Storage backends holding namespaced vault records

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::VaultResult;

/// One stored value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRecord {
    /// Plaintext lookup key
    pub key: String,
    /// base64(nonce || ciphertext || tag) of the JSON value
    pub encrypted: String,
    /// Insertion time, epoch milliseconds
    pub timestamp: u64,
}

/// Backend that keeps records grouped by namespace.
///
/// Namespaces are created explicitly and deleted as a whole.
pub trait StorageBackend: Send + Sync {
    /// Create the namespace if it does not exist yet
    fn create(&self, namespace: &str) -> VaultResult<()>;

    /// Append a record to an existing namespace
    fn append(&self, namespace: &str, record: VaultRecord) -> VaultResult<()>;

    /// All records in insertion order; empty for a missing namespace
    fn records(&self, namespace: &str) -> VaultResult<Vec<VaultRecord>>;

    /// Remove every record but keep the namespace
    fn clear(&self, namespace: &str) -> VaultResult<()>;

    /// Remove the namespace entirely
    fn delete(&self, namespace: &str) -> VaultResult<()>;

    fn exists(&self, namespace: &str) -> bool;
}

/// Process-local in-memory backend
#[derive(Debug, Default)]
pub struct MemoryStorage {
    namespaces: DashMap<String, Vec<VaultRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live namespaces
    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }
}

impl StorageBackend for MemoryStorage {
    fn create(&self, namespace: &str) -> VaultResult<()> {
        self.namespaces.entry(namespace.to_string()).or_default();
        Ok(())
    }

    fn append(&self, namespace: &str, record: VaultRecord) -> VaultResult<()> {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    fn records(&self, namespace: &str) -> VaultResult<Vec<VaultRecord>> {
        Ok(self
            .namespaces
            .get(namespace)
            .map(|records| records.value().clone())
            .unwrap_or_default())
    }

    fn clear(&self, namespace: &str) -> VaultResult<()> {
        if let Some(mut records) = self.namespaces.get_mut(namespace) {
            records.clear();
        }
        Ok(())
    }

    fn delete(&self, namespace: &str) -> VaultResult<()> {
        self.namespaces.remove(namespace);
        Ok(())
    }

    fn exists(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }
}

/// Backend writing one JSON file per namespace under a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> VaultResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        self.root.join(format!("{}.json", namespace))
    }

    fn write(&self, namespace: &str, records: &[VaultRecord]) -> VaultResult<()> {
        let path = self.path_for(namespace);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(records)?)?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn create(&self, namespace: &str) -> VaultResult<()> {
        if !self.exists(namespace) {
            self.write(namespace, &[])?;
        }
        Ok(())
    }

    fn append(&self, namespace: &str, record: VaultRecord) -> VaultResult<()> {
        let mut records = self.records(namespace)?;
        records.push(record);
        self.write(namespace, &records)
    }

    fn records(&self, namespace: &str) -> VaultResult<Vec<VaultRecord>> {
        match fs::read(self.path_for(namespace)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self, namespace: &str) -> VaultResult<()> {
        if self.exists(namespace) {
            self.write(namespace, &[])?;
        }
        Ok(())
    }

    fn delete(&self, namespace: &str) -> VaultResult<()> {
        match fs::remove_file(self.path_for(namespace)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, namespace: &str) -> bool {
        self.path_for(namespace).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, timestamp: u64) -> VaultRecord {
        VaultRecord {
            key: key.to_string(),
            encrypted: "AAAA".to_string(),
            timestamp,
        }
    }

    fn exercise(storage: &dyn StorageBackend) {
        assert!(!storage.exists("ns"));
        assert!(storage.records("ns").unwrap().is_empty());

        storage.create("ns").unwrap();
        assert!(storage.exists("ns"));

        storage.append("ns", record("a", 1)).unwrap();
        storage.append("ns", record("b", 2)).unwrap();
        assert_eq!(
            storage.records("ns").unwrap(),
            vec![record("a", 1), record("b", 2)]
        );

        storage.clear("ns").unwrap();
        assert!(storage.exists("ns"));
        assert!(storage.records("ns").unwrap().is_empty());

        storage.delete("ns").unwrap();
        assert!(!storage.exists("ns"));
        storage.delete("ns").unwrap();
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        exercise(&storage);
        assert_eq!(storage.namespace_count(), 0);
    }

    #[test]
    fn test_file_storage() {
        let root = std::env::temp_dir().join(format!("hushlink-storage-{}", uuid::Uuid::new_v4()));
        let storage = FileStorage::new(&root).unwrap();
        exercise(&storage);
        fs::remove_dir_all(root).unwrap();
    }
}
