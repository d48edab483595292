//! Indexing configuration
//!
//! Sizing knobs for leaves, the range leaf merge cap, timestamp bucketing and
//! the tree handler's rotation and shutdown behavior.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of slots a fresh precise leaf allocates.
pub const DEFAULT_LEAF_CAPACITY: usize = 16;

/// Upper bound for a single merged byte range (8 MiB).
pub const MAX_RANGE_SIZE: u64 = 8 * 1024 * 1024;

/// Default width of a timestamp bucket (15 minutes).
pub const DEFAULT_TIMESTAMP_BUCKET_MILLIS: i64 = 15 * 60 * 1000;

/// Indexing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Initial slot count of a precise leaf; doubles on demand
    pub initial_leaf_capacity: usize,

    /// Largest byte range a range leaf will produce by merging
    pub max_range_size: u64,

    /// Width of a timestamp routing bucket in milliseconds
    pub timestamp_bucket_millis: i64,

    /// Estimated tree footprint (bytes) after which the handler rotates to a fresh tree
    pub maximum_tree_size: u64,

    /// Sleep between checks while `finish` waits for in-flight writes
    pub finish_wait_millis: u64,

    /// Number of checks `finish` performs before saving anyway
    pub finish_wait_iterations: u32,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            initial_leaf_capacity: DEFAULT_LEAF_CAPACITY,
            max_range_size: MAX_RANGE_SIZE,
            timestamp_bucket_millis: DEFAULT_TIMESTAMP_BUCKET_MILLIS,
            maximum_tree_size: 50 * 1024 * 1024, // 50MB
            finish_wait_millis: 1000,
            finish_wait_iterations: 30,
        }
    }
}

impl IndexingConfig {
    /// Fast-finishing configuration for tests
    pub fn for_testing() -> Self {
        Self {
            finish_wait_millis: 10,
            finish_wait_iterations: 5,
            ..Default::default()
        }
    }

    /// Check that every size is usable
    pub fn validate(&self) -> Result<()> {
        if self.initial_leaf_capacity == 0 {
            return Err(StorageError::InvalidConfig(
                "initial_leaf_capacity must be greater than zero".into(),
            ));
        }
        if self.max_range_size == 0 || self.max_range_size > u32::MAX as u64 {
            return Err(StorageError::InvalidConfig(format!(
                "max_range_size must be in 1..={}, got {}",
                u32::MAX,
                self.max_range_size
            )));
        }
        if self.timestamp_bucket_millis <= 0 {
            return Err(StorageError::InvalidConfig(format!(
                "timestamp_bucket_millis must be positive, got {}",
                self.timestamp_bucket_millis
            )));
        }
        if self.maximum_tree_size == 0 {
            return Err(StorageError::InvalidConfig(
                "maximum_tree_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: IndexingConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as pretty JSON
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path.as_ref(), data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let config = IndexingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_leaf_capacity, 16);
        assert_eq!(config.max_range_size, 8 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = IndexingConfig {
            initial_leaf_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StorageError::InvalidConfig(_))));

        let config = IndexingConfig {
            max_range_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IndexingConfig {
            timestamp_bucket_millis: -5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_and_partial_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("indexing.json");

        let config = IndexingConfig {
            initial_leaf_capacity: 64,
            ..IndexingConfig::for_testing()
        };
        config.to_json_file(&path).unwrap();
        assert_eq!(IndexingConfig::from_json_file(&path).unwrap(), config);

        // Missing fields fall back to defaults
        std::fs::write(&path, br#"{ "max_range_size": 1024 }"#).unwrap();
        let loaded = IndexingConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.max_range_size, 1024);
        assert_eq!(loaded.initial_leaf_capacity, DEFAULT_LEAF_CAPACITY);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, br#"{ "initial_leaf_capacity": 0 }"#).unwrap();
        assert!(IndexingConfig::from_json_file(&path).is_err());
    }
}
