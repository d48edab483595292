//! Array based storage leaf
//!
//! Precise leaf: keeps the id of every indexed element together with its byte
//! range, in two index-aligned arrays sorted by id.
//!
//! ## Layout (persisted, field order is part of the index file format)
//! ```text
//! id:               i32
//! capacity:         u64
//! size:             u64
//! id_array:         [i64; capacity]      sorted over [0, size), zero beyond; size < capacity
//! descriptor_array: [Option<SimpleStorageDescriptor>; capacity]
//! ```
//!
//! Removals are rare in storage workloads (only when a write is undone) and new
//! ids usually arrive in ascending order, so inserts mostly append. The arrays
//! are only copied as a whole when the capacity doubles.
//!
//! A `None` descriptor at an occupied slot marks a payload whose write failed:
//! the id stays reserved but lookups treat it as absent.
//!
//! Every insert also stamps its slot with a generation (in memory only). Bound
//! descriptors carry it, so a handle from before a remove and re-put of the
//! same id can not reach the new record's slot.

use super::descriptor::{BoundDescriptor, DescriptorTarget, SimpleStorageDescriptor, StorageDescriptor};
use super::leaf_id::{next_leaf_id, reserve_leaf_id};
use super::query::IndexQuery;
use super::sizes::ObjectSizes;
use super::StorageTreeComponent;
use crate::config::DEFAULT_LEAF_CAPACITY;
use crate::types::IndexedElement;
use crate::{Result, StorageError};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

/// Sorted id/descriptor arrays guarded by the leaf lock
#[derive(Debug)]
pub(crate) struct LeafSlots {
    capacity: usize,
    size: usize,
    id_array: Vec<i64>,
    descriptor_array: Vec<Option<SimpleStorageDescriptor>>,
    /// Insert generation per slot, aligned with `id_array`; not persisted
    generation_array: Vec<u64>,
    next_generation: u64,
}

impl LeafSlots {
    fn with_capacity(capacity: usize) -> Self {
        Self::from_arrays(capacity, 0, vec![0; capacity], vec![None; capacity])
    }

    fn from_arrays(
        capacity: usize,
        size: usize,
        id_array: Vec<i64>,
        descriptor_array: Vec<Option<SimpleStorageDescriptor>>,
    ) -> Self {
        Self {
            capacity,
            size,
            id_array,
            descriptor_array,
            generation_array: vec![0; capacity],
            next_generation: 1,
        }
    }

    fn search(&self, id: i64) -> std::result::Result<usize, usize> {
        self.id_array[..self.size].binary_search(&id)
    }

    /// Insert keeping the arrays sorted. Returns the slot generation, `None` if `id` is already present.
    fn insert(&mut self, id: i64, descriptor: Option<SimpleStorageDescriptor>) -> Option<u64> {
        let index = match self.search(id) {
            Ok(_) => return None,
            Err(insertion_point) => insertion_point.min(self.size),
        };

        let old_size = self.size;
        self.size += 1;

        if self.size == self.capacity {
            let new_capacity = self.capacity * 2;
            let mut id_array = vec![0; new_capacity];
            let mut descriptor_array = vec![None; new_capacity];
            let mut generation_array = vec![0; new_capacity];

            id_array[..index].copy_from_slice(&self.id_array[..index]);
            descriptor_array[..index].copy_from_slice(&self.descriptor_array[..index]);
            generation_array[..index].copy_from_slice(&self.generation_array[..index]);
            if index < old_size {
                id_array[index + 1..=old_size].copy_from_slice(&self.id_array[index..old_size]);
                descriptor_array[index + 1..=old_size]
                    .copy_from_slice(&self.descriptor_array[index..old_size]);
                generation_array[index + 1..=old_size]
                    .copy_from_slice(&self.generation_array[index..old_size]);
            }

            self.id_array = id_array;
            self.descriptor_array = descriptor_array;
            self.generation_array = generation_array;
            self.capacity = new_capacity;
            tracing::trace!(capacity = new_capacity, "leaf arrays doubled");
        } else if index < old_size {
            self.id_array.copy_within(index..old_size, index + 1);
            self.descriptor_array.copy_within(index..old_size, index + 1);
            self.generation_array.copy_within(index..old_size, index + 1);
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        self.id_array[index] = id;
        self.descriptor_array[index] = descriptor;
        self.generation_array[index] = generation;
        Some(generation)
    }

    /// `None` if the id is unknown, `Some(None)` for a failed write
    pub(crate) fn lookup(&self, id: i64) -> Option<Option<SimpleStorageDescriptor>> {
        self.search(id).ok().map(|index| self.descriptor_array[index])
    }

    /// Slot of `id` if it still holds the insert stamped with `generation`
    fn bound_slot(&self, id: i64, generation: u64) -> Option<usize> {
        self.search(id)
            .ok()
            .filter(|index| self.generation_array[*index] == generation)
    }

    /// Like [`lookup`](Self::lookup), restricted to the insert stamped with `generation`
    pub(crate) fn lookup_bound(&self, id: i64, generation: u64) -> Option<Option<SimpleStorageDescriptor>> {
        self.bound_slot(id, generation)
            .map(|index| self.descriptor_array[index])
    }

    /// Replace the descriptor of the insert stamped with `generation`.
    /// Returns false if that insert is no longer in the leaf.
    pub(crate) fn update_bound(
        &mut self,
        id: i64,
        generation: u64,
        descriptor: Option<SimpleStorageDescriptor>,
    ) -> bool {
        match self.bound_slot(id, generation) {
            Some(index) => {
                self.descriptor_array[index] = descriptor;
                true
            }
            None => false,
        }
    }

    /// Shift everything after `index` left by one and clear the vacated tail slot
    fn remove_at(&mut self, index: usize) -> Option<SimpleStorageDescriptor> {
        let removed = self.descriptor_array[index];
        self.id_array.copy_within(index + 1..self.size, index);
        self.descriptor_array.copy_within(index + 1..self.size, index);
        self.generation_array.copy_within(index + 1..self.size, index);
        self.size -= 1;
        self.id_array[self.size] = 0;
        self.descriptor_array[self.size] = None;
        self.generation_array[self.size] = 0;
        removed
    }

    fn collect(&self, leaf_id: i32, query: &dyn IndexQuery) -> Vec<StorageDescriptor> {
        let mut start = 0;
        if query.min_id() != 0 {
            start = match self.search(query.min_id()) {
                Ok(index) | Err(index) => index,
            };
        }

        let mut results = Vec::new();
        for index in start..self.size {
            let id = self.id_array[index];
            if id == 0 || !query.accepts_id(id) {
                continue;
            }
            if let Some(simple) = self.descriptor_array[index] {
                results.push(StorageDescriptor::new(leaf_id, simple));
            }
        }
        results
    }
}

/// Persisted form of an [`ArrayBasedStorageLeaf`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ArrayLeafImage {
    id: i32,
    capacity: u64,
    size: u64,
    id_array: Vec<i64>,
    descriptor_array: Vec<Option<SimpleStorageDescriptor>>,
}

impl ArrayLeafImage {
    fn validate(&self) -> Result<()> {
        let capacity = self.capacity as usize;
        let size = self.size as usize;
        if capacity == 0
            || self.id_array.len() != capacity
            || self.descriptor_array.len() != capacity
            || size >= capacity
        {
            return Err(StorageError::Corruption(format!(
                "Leaf {}: inconsistent array layout (capacity {}, size {}, {} ids, {} descriptors)",
                self.id,
                capacity,
                size,
                self.id_array.len(),
                self.descriptor_array.len()
            )));
        }
        let live = &self.id_array[..size];
        if live.contains(&0) || live.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(StorageError::Corruption(format!(
                "Leaf {}: id array is not strictly increasing",
                self.id
            )));
        }
        Ok(())
    }
}

/// Precise storage leaf with one slot per indexed element
pub struct ArrayBasedStorageLeaf {
    id: i32,
    slots: Arc<RwLock<LeafSlots>>,
}

impl ArrayBasedStorageLeaf {
    /// Create a leaf with a freshly drawn random id
    pub fn new() -> Self {
        Self::with_id(next_leaf_id())
    }

    /// Create a leaf with a known id
    pub fn with_id(id: i32) -> Self {
        Self::with_id_and_capacity(id, DEFAULT_LEAF_CAPACITY)
    }

    pub fn with_id_and_capacity(id: i32, capacity: usize) -> Self {
        Self {
            id,
            slots: Arc::new(RwLock::new(LeafSlots::with_capacity(capacity.max(1)))),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Number of occupied slots, including failed writes
    pub fn len(&self) -> usize {
        self.slots.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.read().capacity
    }

    /// Snapshot of the indexed ids in array order
    pub fn ids(&self) -> Vec<i64> {
        let slots = self.slots.read();
        slots.id_array[..slots.size].to_vec()
    }

    /// Reserve a slot for `id` and hand out the descriptor bound to it
    pub fn put_id(&self, id: i64) -> Result<BoundDescriptor> {
        if id == 0 {
            return Err(StorageError::Indexing(
                "Element to index can not have ID that is equal to zero".into(),
            ));
        }

        let generation = self
            .slots
            .write()
            .insert(id, Some(SimpleStorageDescriptor::default()))
            .ok_or_else(|| {
                StorageError::Indexing(format!(
                    "Element {} already indexed in leaf {}",
                    id, self.id
                ))
            })?;

        Ok(BoundDescriptor::new(
            self.id,
            DescriptorTarget::Slot {
                slots: Arc::clone(&self.slots),
                id,
                generation,
            },
        ))
    }

    /// Point lookup; failed writes read as absent
    pub fn get_id(&self, id: i64) -> Option<StorageDescriptor> {
        self.slots
            .read()
            .lookup(id)
            .flatten()
            .map(|simple| StorageDescriptor::new(self.id, simple))
    }

    /// Remove `id` and return its descriptor.
    ///
    /// The search runs under an upgradable read lock, which excludes other
    /// writers, so the found index is still valid once the lock is upgraded.
    pub fn remove_id(&self, id: i64) -> Option<StorageDescriptor> {
        let slots = self.slots.upgradable_read();
        let index = slots.search(id).ok()?;

        let mut slots = RwLockUpgradableReadGuard::upgrade(slots);
        slots
            .remove_at(index)
            .map(|simple| StorageDescriptor::new(self.id, simple))
    }

    pub(crate) fn image(&self) -> ArrayLeafImage {
        let slots = self.slots.read();
        ArrayLeafImage {
            id: self.id,
            capacity: slots.capacity as u64,
            size: slots.size as u64,
            id_array: slots.id_array.clone(),
            descriptor_array: slots.descriptor_array.clone(),
        }
    }

    pub(crate) fn from_image(image: ArrayLeafImage) -> Result<Self> {
        image.validate()?;
        reserve_leaf_id(image.id);
        Ok(Self {
            id: image.id,
            slots: Arc::new(RwLock::new(LeafSlots::from_arrays(
                image.capacity as usize,
                image.size as usize,
                image.id_array,
                image.descriptor_array,
            ))),
        })
    }
}

impl Default for ArrayBasedStorageLeaf {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTreeComponent for ArrayBasedStorageLeaf {
    fn put<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<BoundDescriptor> {
        self.put_id(element.id())
    }

    fn get<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<Option<StorageDescriptor>> {
        Ok(self.get_id(element.id()))
    }

    fn get_and_remove<E: IndexedElement + ?Sized>(
        &self,
        element: &E,
    ) -> Result<Option<StorageDescriptor>> {
        Ok(self.remove_id(element.id()))
    }

    fn query(&self, query: &dyn IndexQuery) -> Vec<StorageDescriptor> {
        self.slots.read().collect(self.id, query)
    }

    /// Nothing to compact.
    fn pre_write_finalization(&self) {}

    fn component_size(&self, sizes: &ObjectSizes) -> u64 {
        let slots = self.slots.read();
        let descriptor_size = std::mem::size_of::<Option<SimpleStorageDescriptor>>() as u64;

        let mut size = sizes.object_header();
        size += sizes.primitive_types_size(1, 0, 1, 0);
        // Shared slot block: lock word, capacity, size and the two arrays
        size += sizes.align_to_8(sizes.object_header() + sizes.primitive_types_size(0, 8, 0, 2));
        size += sizes.array_size(slots.capacity, 8);
        size += sizes.array_size(slots.capacity, descriptor_size);
        sizes.align_to_8(size)
    }
}

impl Serialize for ArrayBasedStorageLeaf {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.image().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ArrayBasedStorageLeaf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let image = ArrayLeafImage::deserialize(deserializer)?;
        Self::from_image(image).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Debug for ArrayBasedStorageLeaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("ArrayBasedStorageLeaf")
            .field("id", &self.id)
            .field("elements", &slots.size)
            .field("capacity", &slots.capacity)
            .finish()
    }
}
