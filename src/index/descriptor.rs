//! Storage descriptors
//!
//! A descriptor tells where the serialized payload of a record lives: which
//! leaf (and therefore which channel/file) and which byte range inside it.
//!
//! ## Layout
//! ```text
//! StorageDescriptor
//!   - leaf_id: i32                      (identity of the owning leaf)
//!   - simple: SimpleStorageDescriptor
//!       - position: u64                 (byte offset in the payload file)
//!       - size: u32                     (byte length)
//! ```
//!
//! Only the simple part is persisted inside a leaf. The leaf id is stamped on
//! when a descriptor leaves the tree.

use super::array_leaf::LeafSlots;
use super::range_leaf::RangeSet;
use crate::{Result, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Byte range of one payload inside a leaf's backing storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimpleStorageDescriptor {
    position: u64,
    size: u32,
}

impl SimpleStorageDescriptor {
    pub fn new(position: u64, size: u32) -> Self {
        Self { position, size }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// First byte after the range, saturating at `u64::MAX`
    pub fn end(&self) -> u64 {
        self.position.saturating_add(self.size as u64)
    }

    /// True for the placeholder handed out before the payload is written
    pub fn is_empty(&self) -> bool {
        self.position == 0 && self.size == 0
    }

    pub fn set_position_and_size(&mut self, position: u64, size: u32) {
        self.position = position;
        self.size = size;
    }

    /// Absorb `[position, position + size)` if it touches or overlaps this range.
    ///
    /// The result is the union of both ranges. Returns false and leaves `self`
    /// untouched when the ranges are disjoint or the union does not fit a `u32`.
    pub fn join(&mut self, position: u64, size: u32) -> bool {
        self.join_bounded(position, size, u32::MAX as u64)
    }

    /// Like [`join`](Self::join), but refuses when the union would exceed `max_size` bytes.
    /// Ranges reaching past `u64::MAX` are never joined.
    pub fn join_bounded(&mut self, position: u64, size: u32, max_size: u64) -> bool {
        let (Some(own_end), Some(other_end)) = (
            self.position.checked_add(self.size as u64),
            position.checked_add(size as u64),
        ) else {
            return false;
        };
        if other_end < self.position || position > own_end {
            return false;
        }

        let start = self.position.min(position);
        let end = own_end.max(other_end);
        let merged = end - start;
        if merged > max_size || merged > u32::MAX as u64 {
            return false;
        }

        self.position = start;
        self.size = merged as u32;
        true
    }

    /// Bounded join with another descriptor
    pub fn join_descriptor(&mut self, other: &SimpleStorageDescriptor, max_size: u64) -> bool {
        self.join_bounded(other.position, other.size, max_size)
    }
}

/// Externally visible descriptor: leaf identity plus byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageDescriptor {
    leaf_id: i32,
    simple: SimpleStorageDescriptor,
}

impl StorageDescriptor {
    pub fn new(leaf_id: i32, simple: SimpleStorageDescriptor) -> Self {
        Self { leaf_id, simple }
    }

    /// Descriptor with an empty byte range
    pub fn empty(leaf_id: i32) -> Self {
        Self::new(leaf_id, SimpleStorageDescriptor::default())
    }

    pub fn leaf_id(&self) -> i32 {
        self.leaf_id
    }

    /// Channel the payload is written to; one channel per leaf id
    pub fn channel_id(&self) -> i32 {
        self.leaf_id
    }

    pub fn position(&self) -> u64 {
        self.simple.position
    }

    pub fn size(&self) -> u32 {
        self.simple.size
    }

    pub fn simple(&self) -> SimpleStorageDescriptor {
        self.simple
    }
}

/// Where a bound descriptor reports the final byte range to
#[derive(Clone)]
pub(crate) enum DescriptorTarget {
    /// Slot of a precise leaf, found again by id on every update and only
    /// accepted while it still holds the insert stamped with `generation`
    Slot {
        slots: Arc<RwLock<LeafSlots>>,
        id: i64,
        generation: u64,
    },
    /// Range set of a leaf that keeps no per-record descriptors
    Range { ranges: Arc<RangeSet> },
}

/// Live handle returned by `put`.
///
/// The payload position is unknown at insertion time. Once the writer has
/// serialized the record it calls [`set_position_and_size`](Self::set_position_and_size)
/// and the owning leaf is updated in place.
#[derive(Clone)]
pub struct BoundDescriptor {
    leaf_id: i32,
    target: DescriptorTarget,
}

impl BoundDescriptor {
    pub(crate) fn new(leaf_id: i32, target: DescriptorTarget) -> Self {
        Self { leaf_id, target }
    }

    pub fn leaf_id(&self) -> i32 {
        self.leaf_id
    }

    pub fn channel_id(&self) -> i32 {
        self.leaf_id
    }

    /// Report the byte range the payload was written to.
    ///
    /// Fails with `Indexing` if the id was removed from its leaf in the meantime,
    /// even if the same id has been put again since.
    pub fn set_position_and_size(&self, position: u64, size: u32) -> Result<()> {
        match &self.target {
            DescriptorTarget::Slot { slots, id, generation } => {
                let updated = slots.write().update_bound(
                    *id,
                    *generation,
                    Some(SimpleStorageDescriptor::new(position, size)),
                );
                if updated {
                    Ok(())
                } else {
                    Err(StorageError::Indexing(format!(
                        "Element {} is no longer indexed in leaf {}",
                        id, self.leaf_id
                    )))
                }
            }
            DescriptorTarget::Range { ranges } => {
                ranges.record_write(position, size);
                Ok(())
            }
        }
    }

    /// Mark the payload write as failed.
    ///
    /// A precise leaf keeps the id reserved but stops returning it. A range leaf
    /// can not retract the space it may already have merged, so this is a no-op there.
    pub fn mark_failed(&self) {
        if let DescriptorTarget::Slot { slots, id, generation } = &self.target {
            slots.write().update_bound(*id, *generation, None);
        }
    }

    /// Current state of the descriptor as stored by the leaf
    pub fn descriptor(&self) -> StorageDescriptor {
        match &self.target {
            DescriptorTarget::Slot { slots, id, generation } => {
                let simple = slots
                    .read()
                    .lookup_bound(*id, *generation)
                    .flatten()
                    .unwrap_or_default();
                StorageDescriptor::new(self.leaf_id, simple)
            }
            DescriptorTarget::Range { .. } => StorageDescriptor::empty(self.leaf_id),
        }
    }
}

impl std::fmt::Debug for BoundDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.target {
            DescriptorTarget::Slot { .. } => "slot",
            DescriptorTarget::Range { .. } => "range",
        };
        f.debug_struct("BoundDescriptor")
            .field("leaf_id", &self.leaf_id)
            .field("target", &kind)
            .finish()
    }
}
