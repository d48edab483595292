//! Index persistence and write coordination

pub mod persistence;
pub mod tree_handler;

pub use persistence::{load_combined, load_tree, save_tree, INDEX_FILE_EXTENSION};
pub use tree_handler::{IndexingTreeHandler, TaskId};
