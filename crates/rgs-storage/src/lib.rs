//! Storage primitives shared by every subsystem (B–J): a backend-agnostic
//! `KvTree` abstraction with a durable (sled) and an in-memory fallback
//! implementation, selected once at startup (§9 design notes).

pub mod backend;
pub mod error;
pub mod tree;

pub use backend::{composite_key, Backend, BackendKind};
pub use error::StorageError;
pub use tree::{decode, encode, KvTree};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_roundtrips_a_value() {
        let backend = Backend::in_memory();
        let tree = backend.open_tree("widgets").unwrap();
        tree.insert(b"k1", b"v1".to_vec()).unwrap();
        assert_eq!(tree.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn sled_backend_roundtrips_a_value() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open_durable(dir.path()).unwrap();
        assert_eq!(backend.kind(), BackendKind::Durable);
        let tree = backend.open_tree("widgets").unwrap();
        tree.insert(b"k1", b"v1".to_vec()).unwrap();
        assert_eq!(tree.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn remove_clears_the_key() {
        let backend = Backend::in_memory();
        let tree = backend.open_tree("widgets").unwrap();
        tree.insert(b"k1", b"v1".to_vec()).unwrap();
        tree.remove(b"k1").unwrap();
        assert_eq!(tree.get(b"k1").unwrap(), None);
    }
}
