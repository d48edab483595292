//! Storage branch
//!
//! Interior node routing elements to children by the key its indexer derives.
//! Children are created on demand by `put`; lookups and queries never create
//! children.

use super::descriptor::{BoundDescriptor, StorageDescriptor};
use super::indexer::{IndexKey, KeySelection, StorageBranchIndexer};
use super::query::IndexQuery;
use super::sizes::ObjectSizes;
use super::{StorageTreeComponent, TreeNode};
use crate::types::IndexedElement;
use crate::{Result, StorageError};
use ahash::AHashMap;
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

/// Branch of a storage indexing tree
pub struct StorageBranch {
    indexer: StorageBranchIndexer,
    children: RwLock<AHashMap<IndexKey, Arc<TreeNode>>>,
}

/// Persisted form of a [`StorageBranch`]; children sorted by key
#[derive(Serialize, Deserialize)]
struct BranchImage {
    indexer: StorageBranchIndexer,
    children: Vec<(IndexKey, Arc<TreeNode>)>,
}

impl StorageBranch {
    pub fn new(indexer: StorageBranchIndexer) -> Self {
        Self {
            indexer,
            children: RwLock::new(AHashMap::new()),
        }
    }

    pub fn indexer(&self) -> &StorageBranchIndexer {
        &self.indexer
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    pub fn child(&self, key: &IndexKey) -> Option<Arc<TreeNode>> {
        self.children.read().get(key).cloned()
    }

    /// Children in key order
    pub fn children(&self) -> Vec<(IndexKey, Arc<TreeNode>)> {
        let mut children: Vec<_> = self
            .children
            .read()
            .iter()
            .map(|(key, child)| (key.clone(), Arc::clone(child)))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    /// Child for `key`, created under the write lock if missing.
    ///
    /// The map lock is released before the caller descends, so puts into
    /// different children do not serialize on the branch.
    fn child_for_put(&self, key: IndexKey) -> Arc<TreeNode> {
        if let Some(child) = self.children.read().get(&key) {
            return Arc::clone(child);
        }

        let mut children = self.children.write();
        let child = children.entry(key).or_insert_with_key(|key| {
            tracing::debug!(?key, indexer = ?self.indexer.kind(), "creating branch child");
            Arc::new(self.indexer.next_component())
        });
        Arc::clone(child)
    }

    fn selected_children(&self, selection: &KeySelection) -> Vec<Arc<TreeNode>> {
        match selection {
            KeySelection::Keys(keys) => {
                let children = self.children.read();
                keys.iter().filter_map(|key| children.get(key).cloned()).collect()
            }
            _ => self
                .children()
                .into_iter()
                .filter(|(key, _)| selection.matches(key))
                .map(|(_, child)| child)
                .collect(),
        }
    }

    /// Keyed child if the element yields a key, otherwise every child in key order
    fn lookup_candidates<E: IndexedElement + ?Sized>(&self, element: &E) -> Vec<Arc<TreeNode>> {
        match self.indexer.key(element) {
            Some(key) => self.child(&key).into_iter().collect(),
            None => self.children().into_iter().map(|(_, child)| child).collect(),
        }
    }
}

impl StorageTreeComponent for StorageBranch {
    fn put<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<BoundDescriptor> {
        let key = self.indexer.key(element).ok_or_else(|| {
            StorageError::Indexing(format!(
                "Element {} has no key for indexer {:?}",
                element.id(),
                self.indexer.kind()
            ))
        })?;
        self.child_for_put(key).put(element)
    }

    fn get<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<Option<StorageDescriptor>> {
        for child in self.lookup_candidates(element) {
            if let Some(descriptor) = child.get(element)? {
                return Ok(Some(descriptor));
            }
        }
        Ok(None)
    }

    fn get_and_remove<E: IndexedElement + ?Sized>(
        &self,
        element: &E,
    ) -> Result<Option<StorageDescriptor>> {
        for child in self.lookup_candidates(element) {
            if let Some(descriptor) = child.get_and_remove(element)? {
                return Ok(Some(descriptor));
            }
        }
        Ok(None)
    }

    fn query(&self, query: &dyn IndexQuery) -> Vec<StorageDescriptor> {
        let selection = self.indexer.selection(query);
        self.selected_children(&selection)
            .iter()
            .flat_map(|child| child.query(query))
            .collect()
    }

    fn pre_write_finalization(&self) {
        let children: Vec<Arc<TreeNode>> = self.children.read().values().cloned().collect();
        children
            .par_iter()
            .for_each(|child| child.pre_write_finalization());
    }

    fn component_size(&self, sizes: &ObjectSizes) -> u64 {
        let children = self.children.read();
        let entry_size = std::mem::size_of::<(IndexKey, Arc<TreeNode>)>() as u64;

        let mut size = sizes.object_header();
        size += sizes.primitive_types_size(2, 0, 0, 0);
        size += sizes.align_to_8(sizes.object_header() + sizes.primitive_types_size(4, 0, 1, 1));
        size += sizes.hash_map_size(children.len(), entry_size);
        size += children
            .values()
            .map(|child| sizes.object_header() + child.component_size(sizes))
            .sum::<u64>();
        sizes.align_to_8(size)
    }
}

impl Serialize for StorageBranch {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        BranchImage {
            indexer: self.indexer.clone(),
            children: self.children(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StorageBranch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let image = BranchImage::deserialize(deserializer)?;
        Ok(Self {
            indexer: image.indexer,
            children: RwLock::new(image.children.into_iter().collect()),
        })
    }
}

impl std::fmt::Debug for StorageBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBranch")
            .field("indexer", self.indexer.kind())
            .field("children", &self.child_count())
            .finish()
    }
}
