use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::StorageError;
use crate::tree::{KvTree, MemTree, SledTree};

/// What a storage backend can be trusted to do. Strict-production mode
/// requires `Durable` for every state-changing path (§9, §6
/// `strict_production`); the in-memory fallback only ever reports
/// `InMemory` and every subsystem checks that against its own strictness
/// flag before performing a state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Durable,
    InMemory,
}

impl BackendKind {
    pub fn is_durable(&self) -> bool {
        matches!(self, BackendKind::Durable)
    }
}

/// The concrete storage backend chosen at startup. One `Backend` is
/// shared (via `Arc`) by every subsystem repository; each repository
/// opens the named trees it needs.
pub enum Backend {
    Sled(sled::Db),
    Memory(Arc<DashMap<String, Arc<DashMap<Vec<u8>, Vec<u8>>>>>),
}

impl Backend {
    pub fn open_durable<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Backend::Sled(db))
    }

    pub fn in_memory() -> Self {
        Backend::Memory(Arc::new(DashMap::new()))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Sled(_) => BackendKind::Durable,
            Backend::Memory(_) => BackendKind::InMemory,
        }
    }

    pub fn open_tree(&self, name: &str) -> Result<Arc<dyn KvTree>, StorageError> {
        match self {
            Backend::Sled(db) => {
                let tree = db
                    .open_tree(name)
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(Arc::new(SledTree(tree)))
            }
            Backend::Memory(trees) => {
                let tree = trees
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(DashMap::new()))
                    .clone();
                Ok(Arc::new(MemTree(tree)))
            }
        }
    }
}

/// Join composite key parts with a separator byte that cannot appear in
/// any part (ids here are UUIDs/hex/base58, none of which use 0x1F).
pub fn composite_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            out.push(0x1f);
        }
        out.extend_from_slice(p);
    }
    out
}
