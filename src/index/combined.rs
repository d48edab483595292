//! Combined storage branch
//!
//! Read-only federation of already built (and finalized) trees. It has no
//! routing key of its own, so it can not decide where a new element belongs:
//! `put` and `get_and_remove` are refused. Lookups try the children in the
//! order they were added and the first hit wins; queries concatenate the
//! children's results in that order without deduplication.

use super::descriptor::{BoundDescriptor, StorageDescriptor};
use super::query::IndexQuery;
use super::sizes::ObjectSizes;
use super::{StorageTreeComponent, TreeNode};
use crate::types::IndexedElement;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Default, Serialize, Deserialize)]
pub struct CombinedStorageBranch {
    children: Vec<Arc<TreeNode>>,
}

impl CombinedStorageBranch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_components(children: Vec<Arc<TreeNode>>) -> Self {
        Self { children }
    }

    /// Append a component; only used while assembling, before the branch is queried
    pub fn add_branch(&mut self, component: Arc<TreeNode>) {
        self.children.push(component);
    }

    pub fn children(&self) -> &[Arc<TreeNode>] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl StorageTreeComponent for CombinedStorageBranch {
    fn put<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<BoundDescriptor> {
        tracing::warn!(element_id = element.id(), "put refused by combined branch");
        Err(StorageError::Unsupported(
            "Combined storage branch is read-only and can not index elements".into(),
        ))
    }

    fn get<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<Option<StorageDescriptor>> {
        for child in &self.children {
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
        tracing::warn!(element_id = element.id(), "removal refused by combined branch");
        Err(StorageError::Unsupported(
            "Combined storage branch is read-only and can not remove elements".into(),
        ))
    }

    fn query(&self, query: &dyn IndexQuery) -> Vec<StorageDescriptor> {
        self.children
            .iter()
            .flat_map(|child| child.query(query))
            .collect()
    }

    fn pre_write_finalization(&self) {
        for child in &self.children {
            child.pre_write_finalization();
        }
    }

    fn component_size(&self, sizes: &ObjectSizes) -> u64 {
        let mut size = sizes.object_header();
        size += sizes.primitive_types_size(1, 0, 0, 0);
        size += sizes.array_size(self.children.capacity(), sizes.reference_size());
        size += self
            .children
            .iter()
            .map(|child| child.component_size(sizes))
            .sum::<u64>();
        sizes.align_to_8(size)
    }
}

impl std::fmt::Debug for CombinedStorageBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedStorageBranch")
            .field("children", &self.children)
            .finish()
    }
}
