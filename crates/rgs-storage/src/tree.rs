use std::sync::Arc;

use dashmap::DashMap;

use crate::error::StorageError;

/// A single named table of byte-key → byte-value pairs.
///
/// Subsystem repositories are built entirely against this trait so that
/// the same repository code runs unmodified against the durable (sled)
/// backend or the in-memory fallback (§9 "dynamic dispatch over storage
/// backends... modeled as a capability set").
pub trait KvTree: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError>;
    fn remove(&self, key: &[u8]) -> Result<(), StorageError>;
    fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).ok().flatten().is_some()
    }
    /// All `(key, value)` pairs. Callers that need an order other than
    /// insertion/iteration order must sort the result themselves — no
    /// `KvTree` implementation guarantees key ordering.
    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SledTree(pub sled::Tree);

impl KvTree for SledTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.0
            .get(key)
            .map(|opt| opt.map(|v| v.to_vec()))
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.0
            .insert(key, value)
            .map(|_| ())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.0
            .remove(key)
            .map(|_| ())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.0
            .iter()
            .map(|item| {
                item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// In-memory fallback tree, used when `strict_production` is off and no
/// durable backend is configured. Never selectable for state-changing
/// paths in strict mode (§9).
#[derive(Default)]
pub struct MemTree(pub Arc<DashMap<Vec<u8>, Vec<u8>>>);

impl KvTree for MemTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.0.get(key).map(|v| v.clone()))
    }

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.0.insert(key.to_vec(), value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.0.remove(key);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(self
            .0
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Serialize with `bincode`, the teacher's on-disk encoding for structured
/// records.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
