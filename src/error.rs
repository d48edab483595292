//! Error types for the storage indexing tree

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Element can not be indexed (missing id, duplicate id, no routing key).
    #[error("Indexing error: {0}")]
    Indexing(String),

    /// Operation the component structurally can not perform.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StorageError {
    pub fn is_indexing(&self) -> bool {
        matches!(self, StorageError::Indexing(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, StorageError::Unsupported(_))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
