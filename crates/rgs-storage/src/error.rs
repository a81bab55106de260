use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StorageError> for rgs_core::RgsError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Backend(s) => rgs_core::RgsError::Storage(s),
            StorageError::Serialization(s) => rgs_core::RgsError::Serialization(s),
        }
    }
}
