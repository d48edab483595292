//! Storage indexing tree
//!
//! Maps stored elements to the location of their serialized bytes. A tree is
//! built from branches that route elements by a derived key, and leaves that
//! hold descriptors: precise leaves keep one descriptor per element id, range
//! leaves only keep the merged byte ranges written through them.
//!
//! Nodes form a closed set, so the tree is a plain enum ([`TreeNode`]) and
//! every node type implements [`StorageTreeComponent`].

pub mod array_leaf;
pub mod branch;
pub mod combined;
pub mod descriptor;
pub mod indexer;
pub mod leaf_id;
pub mod query;
pub mod range_leaf;
pub mod sizes;

pub use array_leaf::ArrayBasedStorageLeaf;
pub use branch::StorageBranch;
pub use combined::CombinedStorageBranch;
pub use descriptor::{BoundDescriptor, SimpleStorageDescriptor, StorageDescriptor};
pub use indexer::{IndexKey, IndexerKind, KeySelection, LeafKind, StorageBranchIndexer, TreeTemplate};
pub use query::{BasicIndexQuery, IndexQuery, StorageIndexQuery};
pub use range_leaf::LeafWithNoDescriptors;
pub use sizes::ObjectSizes;

use crate::types::IndexedElement;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Operations shared by every node of a storage indexing tree
pub trait StorageTreeComponent: Send + Sync {
    /// Index `element` and return the descriptor the writer fills in once
    /// the element's bytes are written.
    fn put<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<BoundDescriptor>;

    /// Descriptor stored for `element`, `None` if it was never indexed here.
    fn get<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<Option<StorageDescriptor>>;

    /// Like [`get`](Self::get), and removes the element from the tree.
    fn get_and_remove<E: IndexedElement + ?Sized>(
        &self,
        element: &E,
    ) -> Result<Option<StorageDescriptor>>;

    /// All descriptors matching `query`.
    fn query(&self, query: &dyn IndexQuery) -> Vec<StorageDescriptor>;

    /// Compact internal state before the tree is persisted. Idempotent.
    fn pre_write_finalization(&self);

    /// Estimated in-memory footprint in bytes.
    fn component_size(&self, sizes: &ObjectSizes) -> u64;
}

/// Any node of a storage indexing tree
#[derive(Debug, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf(ArrayBasedStorageLeaf),
    RangeLeaf(LeafWithNoDescriptors),
    Branch(StorageBranch),
    Combined(CombinedStorageBranch),
}

macro_rules! dispatch {
    ($node:expr, $inner:ident => $body:expr) => {
        match $node {
            TreeNode::Leaf($inner) => $body,
            TreeNode::RangeLeaf($inner) => $body,
            TreeNode::Branch($inner) => $body,
            TreeNode::Combined($inner) => $body,
        }
    };
}

impl TreeNode {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TreeNode::Leaf(_) => "leaf",
            TreeNode::RangeLeaf(_) => "range-leaf",
            TreeNode::Branch(_) => "branch",
            TreeNode::Combined(_) => "combined",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, TreeNode::Leaf(_) | TreeNode::RangeLeaf(_))
    }
}

impl StorageTreeComponent for TreeNode {
    fn put<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<BoundDescriptor> {
        dispatch!(self, node => node.put(element))
    }

    fn get<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<Option<StorageDescriptor>> {
        dispatch!(self, node => node.get(element))
    }

    fn get_and_remove<E: IndexedElement + ?Sized>(
        &self,
        element: &E,
    ) -> Result<Option<StorageDescriptor>> {
        dispatch!(self, node => node.get_and_remove(element))
    }

    fn query(&self, query: &dyn IndexQuery) -> Vec<StorageDescriptor> {
        dispatch!(self, node => node.query(query))
    }

    fn pre_write_finalization(&self) {
        dispatch!(self, node => node.pre_write_finalization())
    }

    fn component_size(&self, sizes: &ObjectSizes) -> u64 {
        dispatch!(self, node => node.component_size(sizes))
    }
}

impl From<ArrayBasedStorageLeaf> for TreeNode {
    fn from(leaf: ArrayBasedStorageLeaf) -> Self {
        TreeNode::Leaf(leaf)
    }
}

impl From<LeafWithNoDescriptors> for TreeNode {
    fn from(leaf: LeafWithNoDescriptors) -> Self {
        TreeNode::RangeLeaf(leaf)
    }
}

impl From<StorageBranch> for TreeNode {
    fn from(branch: StorageBranch) -> Self {
        TreeNode::Branch(branch)
    }
}

impl From<CombinedStorageBranch> for TreeNode {
    fn from(branch: CombinedStorageBranch) -> Self {
        TreeNode::Combined(branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordInfo;
    use std::sync::Arc;

    #[test]
    fn test_dispatch_reaches_every_node_kind() {
        let leaf: TreeNode = ArrayBasedStorageLeaf::with_id(1).into();
        let bound = leaf.put(&RecordInfo::new(10, "timer")).unwrap();
        bound.set_position_and_size(0, 20).unwrap();
        assert_eq!(leaf.get(&RecordInfo::new(10, "timer")).unwrap().unwrap().size(), 20);
        assert_eq!(leaf.kind_name(), "leaf");
        assert!(leaf.is_leaf());

        let ranged: TreeNode = LeafWithNoDescriptors::with_id(2).into();
        ranged.put(&RecordInfo::new(11, "timer")).unwrap().set_position_and_size(0, 10).unwrap();
        assert_eq!(ranged.query(&BasicIndexQuery::new()).len(), 1);

        let combined: TreeNode =
            CombinedStorageBranch::from_components(vec![Arc::new(leaf), Arc::new(ranged)]).into();
        assert!(!combined.is_leaf());
        assert_eq!(combined.query(&BasicIndexQuery::new()).len(), 2);
        assert!(combined.component_size(&ObjectSizes::sixty_four_bit()) > 0);
    }

    #[test]
    fn test_tree_serde_keeps_leaf_ids_and_descriptors() {
        let tree = TreeTemplate::default_storage().build(&crate::IndexingConfig::default()).unwrap();
        let record = RecordInfo::new(42, "timer")
            .with_platform(1)
            .with_sensor_type(2)
            .with_timestamp(1_000);
        let bound = tree.put(&record).unwrap();
        bound.set_position_and_size(128, 64).unwrap();
        tree.pre_write_finalization();

        let bytes = bincode::serialize(&tree).unwrap();
        let restored: TreeNode = bincode::deserialize(&bytes).unwrap();

        let found = restored.get(&record).unwrap().unwrap();
        assert_eq!(found.leaf_id(), bound.leaf_id());
        assert_eq!((found.position(), found.size()), (128, 64));
    }
}
