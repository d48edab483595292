//! Storage indexing tree
//!
//! Maps stored monitoring records to the location of their serialized bytes
//! in storage files, and answers queries over those locations.
//!
//! ## Layout
//! - `index`: tree components (precise and range leaves, keyed branches,
//!   read-only combined branches), descriptors and queries
//! - `storage`: index file persistence and the handler coordinating a
//!   storage writer with the live tree
//! - `config`: sizing and rotation settings
//!
//! ```ignore
//! use storage_index_tree::{IndexingConfig, RecordInfo, StorageTreeComponent, TreeTemplate};
//!
//! let tree = TreeTemplate::default_storage().build(&IndexingConfig::default())?;
//! let record = RecordInfo::new(1, "timer").with_platform(1).with_sensor_type(2).with_timestamp(0);
//! let descriptor = tree.put(&record)?;
//! descriptor.set_position_and_size(0, 120)?;
//! ```

pub mod config;
pub mod index;
pub mod storage;
pub mod types;

mod error;

pub use config::IndexingConfig;
pub use error::{Result, StorageError};
pub use index::{
    ArrayBasedStorageLeaf, BasicIndexQuery, BoundDescriptor, CombinedStorageBranch, IndexQuery,
    LeafWithNoDescriptors, ObjectSizes, SimpleStorageDescriptor, StorageBranch,
    StorageBranchIndexer, StorageDescriptor, StorageIndexQuery, StorageTreeComponent, TreeNode,
    TreeTemplate,
};
pub use storage::{load_combined, load_tree, save_tree, IndexingTreeHandler};
pub use types::{IndexedElement, RecordInfo};
