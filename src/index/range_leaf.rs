//! Leaf with no descriptors
//!
//! Compact leaf for records that are only ever read in bulk. It keeps no
//! id -> descriptor mapping at all; every write reported through the shared
//! bound descriptor is folded into a small list of byte ranges, each at most
//! `max_range_size` bytes long (8 MiB by default, the largest chunk a reader
//! pulls in at once).
//!
//! Consequences:
//! - point lookups are unsupported
//! - `get_and_remove` has nothing to remove and always answers `None`, so space
//!   reserved for a write that later fails is never given back
//! - queries return every range and ignore id filters

use super::descriptor::{BoundDescriptor, DescriptorTarget, SimpleStorageDescriptor, StorageDescriptor};
use super::leaf_id::{next_leaf_id, reserve_leaf_id};
use super::query::IndexQuery;
use super::sizes::ObjectSizes;
use super::StorageTreeComponent;
use crate::config::MAX_RANGE_SIZE;
use crate::types::IndexedElement;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

/// Merged byte ranges of one leaf; every mutation is serialized by one mutex
#[derive(Debug)]
pub(crate) struct RangeSet {
    max_range_size: u64,
    descriptors: Mutex<Vec<SimpleStorageDescriptor>>,
}

impl RangeSet {
    fn new(max_range_size: u64, descriptors: Vec<SimpleStorageDescriptor>) -> Self {
        Self {
            max_range_size,
            descriptors: Mutex::new(descriptors),
        }
    }

    /// Fold a written range into the newest range that can absorb it, or append it.
    ///
    /// A single write larger than the cap is kept as its own range.
    pub(crate) fn record_write(&self, position: u64, size: u32) {
        let mut descriptors = self.descriptors.lock();
        let absorbed = descriptors
            .iter_mut()
            .rev()
            .any(|descriptor| descriptor.join_bounded(position, size, self.max_range_size));
        if !absorbed {
            descriptors.push(SimpleStorageDescriptor::new(position, size));
        }
    }

    /// Pairwise merge until no two ranges can be joined. Returns the range count before and after.
    fn compact(&self) -> (usize, usize) {
        let mut descriptors = self.descriptors.lock();
        let before = descriptors.len();
        loop {
            let mut merged_in_pass = false;
            let mut i = 0;
            while i < descriptors.len() {
                let mut j = i + 1;
                while j < descriptors.len() {
                    let other = descriptors[j];
                    if descriptors[i].join_descriptor(&other, self.max_range_size) {
                        descriptors.remove(j);
                        merged_in_pass = true;
                        // The grown range may now reach ones already skipped
                        j = i + 1;
                    } else {
                        j += 1;
                    }
                }
                i += 1;
            }
            if !merged_in_pass {
                break;
            }
        }
        (before, descriptors.len())
    }

    fn snapshot(&self) -> Vec<SimpleStorageDescriptor> {
        self.descriptors.lock().clone()
    }
}

/// Persisted form of a [`LeafWithNoDescriptors`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RangeLeafImage {
    id: i32,
    max_range_size: u64,
    descriptors: Vec<SimpleStorageDescriptor>,
}

/// Leaf that tracks byte ranges instead of individual records
pub struct LeafWithNoDescriptors {
    id: i32,
    ranges: Arc<RangeSet>,
}

impl LeafWithNoDescriptors {
    /// Create a leaf with a freshly drawn random id
    pub fn new() -> Self {
        Self::with_id(next_leaf_id())
    }

    pub fn with_id(id: i32) -> Self {
        Self::with_id_and_max_range(id, MAX_RANGE_SIZE)
    }

    pub fn with_id_and_max_range(id: i32, max_range_size: u64) -> Self {
        Self {
            id,
            ranges: Arc::new(RangeSet::new(max_range_size.max(1), Vec::new())),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn max_range_size(&self) -> u64 {
        self.ranges.max_range_size
    }

    /// Number of ranges currently held
    pub fn range_count(&self) -> usize {
        self.ranges.descriptors.lock().len()
    }

    /// Snapshot of the held ranges
    pub fn ranges(&self) -> Vec<SimpleStorageDescriptor> {
        self.ranges.snapshot()
    }

    /// Record a written byte range directly
    pub fn set_position_and_size(&self, position: u64, size: u32) {
        self.ranges.record_write(position, size);
    }

    /// The descriptor shared by every element put into this leaf
    pub fn bounded_descriptor(&self) -> BoundDescriptor {
        BoundDescriptor::new(
            self.id,
            DescriptorTarget::Range {
                ranges: Arc::clone(&self.ranges),
            },
        )
    }

    pub(crate) fn image(&self) -> RangeLeafImage {
        RangeLeafImage {
            id: self.id,
            max_range_size: self.ranges.max_range_size,
            descriptors: self.ranges.snapshot(),
        }
    }

    pub(crate) fn from_image(image: RangeLeafImage) -> Result<Self> {
        if image.max_range_size == 0 {
            return Err(StorageError::Corruption(format!(
                "Range leaf {}: max range size is zero",
                image.id
            )));
        }
        reserve_leaf_id(image.id);
        Ok(Self {
            id: image.id,
            ranges: Arc::new(RangeSet::new(image.max_range_size, image.descriptors)),
        })
    }
}

impl Default for LeafWithNoDescriptors {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTreeComponent for LeafWithNoDescriptors {
    /// The element itself is ignored; all elements share one bound descriptor.
    fn put<E: IndexedElement + ?Sized>(&self, _element: &E) -> Result<BoundDescriptor> {
        Ok(self.bounded_descriptor())
    }

    fn get<E: IndexedElement + ?Sized>(&self, element: &E) -> Result<Option<StorageDescriptor>> {
        tracing::warn!(leaf_id = self.id, element_id = element.id(), "point lookup on range leaf");
        Err(StorageError::Unsupported(format!(
            "Leaf {} keeps no descriptors and can not answer single element queries",
            self.id
        )))
    }

    fn get_and_remove<E: IndexedElement + ?Sized>(
        &self,
        _element: &E,
    ) -> Result<Option<StorageDescriptor>> {
        Ok(None)
    }

    fn query(&self, _query: &dyn IndexQuery) -> Vec<StorageDescriptor> {
        self.ranges
            .snapshot()
            .into_iter()
            .map(|simple| StorageDescriptor::new(self.id, simple))
            .collect()
    }

    fn pre_write_finalization(&self) {
        let (before, after) = self.ranges.compact();
        tracing::debug!(leaf_id = self.id, before, after, "range leaf compacted");
    }

    fn component_size(&self, sizes: &ObjectSizes) -> u64 {
        let descriptors = self.ranges.descriptors.lock();
        let descriptor_size = std::mem::size_of::<SimpleStorageDescriptor>() as u64;

        let mut size = sizes.object_header();
        size += sizes.primitive_types_size(1, 0, 1, 0);
        size += sizes.align_to_8(sizes.object_header() + sizes.primitive_types_size(0, 8, 0, 1));
        size += sizes.array_size(descriptors.capacity(), descriptor_size);
        sizes.align_to_8(size)
    }
}

impl Serialize for LeafWithNoDescriptors {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.image().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LeafWithNoDescriptors {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let image = RangeLeafImage::deserialize(deserializer)?;
        Self::from_image(image).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Debug for LeafWithNoDescriptors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafWithNoDescriptors")
            .field("id", &self.id)
            .field("ranges", &self.range_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::query::{BasicIndexQuery, StorageIndexQuery};
    use crate::types::RecordInfo;
    use std::thread;

    /// Covered bytes as sorted, coalesced intervals
    fn coverage(ranges: &[SimpleStorageDescriptor]) -> Vec<(u64, u64)> {
        let mut intervals: Vec<(u64, u64)> = ranges.iter().map(|d| (d.position(), d.end())).collect();
        intervals.sort();
        let mut merged: Vec<(u64, u64)> = Vec::new();
        for (start, end) in intervals {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        merged
    }

    #[test]
    fn test_get_is_unsupported() {
        let leaf = LeafWithNoDescriptors::new();
        let record = RecordInfo::new(1, "timer");
        leaf.put(&record).unwrap();

        let result = leaf.get(&record);
        assert!(matches!(result, Err(StorageError::Unsupported(_))));
    }

    #[test]
    fn test_get_and_remove_returns_none() {
        let leaf = LeafWithNoDescriptors::new();
        let record = RecordInfo::new(1, "timer");
        leaf.put(&record).unwrap().set_position_and_size(0, 10).unwrap();

        assert!(leaf.get_and_remove(&record).unwrap().is_none());
        assert_eq!(leaf.range_count(), 1);
    }

    #[test]
    fn test_total_size_matches_written_bytes() {
        let leaf = LeafWithNoDescriptors::with_id(3);
        let mut total = 0u64;
        for id in 1..=100i64 {
            let bound = leaf.put(&RecordInfo::new(id, "timer")).unwrap();
            assert_eq!(bound.leaf_id(), 3);
            bound.set_position_and_size(total, id as u32).unwrap();
            total += id as u64;
        }

        let results = leaf.query(&StorageIndexQuery::new());
        let returned: u64 = results.iter().map(|d| d.size() as u64).sum();
        assert_eq!(returned, total);
        assert_eq!(results.len(), 1);
        assert!(results.iter().all(|d| d.leaf_id() == 3));
    }

    #[test]
    fn test_query_ignores_id_filters() {
        let leaf = LeafWithNoDescriptors::with_id(3);
        leaf.set_position_and_size(0, 10);
        leaf.set_position_and_size(100, 10);

        let query = StorageIndexQuery::new().with_include_ids([42]).with_min_id(7);
        assert_eq!(leaf.query(&query).len(), 2);
    }

    #[test]
    fn test_contiguous_writes_respect_cap() {
        let leaf = LeafWithNoDescriptors::with_id_and_max_range(1, 1000);
        let mut position = 0;
        for _ in 0..35 {
            leaf.set_position_and_size(position, 100);
            position += 100;
        }
        leaf.pre_write_finalization();

        let ranges = leaf.ranges();
        assert!(ranges.iter().all(|d| d.size() as u64 <= 1000));
        assert_eq!(ranges.iter().map(|d| d.size() as u64).sum::<u64>(), 3500);
        assert_eq!(ranges.len(), 4);
    }

    #[test]
    fn test_default_cap_is_eight_mib() {
        let leaf = LeafWithNoDescriptors::with_id(1);
        let chunk = 1024 * 1024;
        for i in 0..20u64 {
            leaf.set_position_and_size(i * chunk as u64, chunk);
        }
        leaf.pre_write_finalization();
        assert!(leaf.ranges().iter().all(|d| d.size() as u64 <= MAX_RANGE_SIZE));
        assert_eq!(leaf.range_count(), 3);
    }

    #[test]
    fn test_finalization_merges_out_of_order_writes() {
        let leaf = LeafWithNoDescriptors::with_id(1);
        // Three islands that only connect once the middle pieces arrive
        leaf.set_position_and_size(0, 10);
        leaf.set_position_and_size(20, 10);
        leaf.set_position_and_size(40, 10);
        leaf.set_position_and_size(30, 10);
        leaf.set_position_and_size(10, 10);
        assert!(leaf.range_count() > 1);

        leaf.pre_write_finalization();
        assert_eq!(leaf.ranges(), vec![SimpleStorageDescriptor::new(0, 50)]);
    }

    #[test]
    fn test_finalization_is_idempotent_and_keeps_coverage() {
        let leaf = LeafWithNoDescriptors::with_id_and_max_range(1, 64);
        let writes = [(0, 8), (40, 8), (16, 8), (8, 8), (100, 4), (24, 16), (96, 4), (48, 30)];
        for (position, size) in writes {
            leaf.set_position_and_size(position, size);
        }

        let before = coverage(&leaf.ranges());
        leaf.pre_write_finalization();
        let once = leaf.ranges();
        assert_eq!(coverage(&once), before);
        assert!(once.iter().all(|d| d.size() <= 64));

        leaf.pre_write_finalization();
        assert_eq!(leaf.ranges(), once);
    }

    #[test]
    fn test_oversized_single_write_kept_whole() {
        let leaf = LeafWithNoDescriptors::with_id_and_max_range(1, 100);
        leaf.set_position_and_size(0, 500);
        leaf.set_position_and_size(500, 10);
        leaf.pre_write_finalization();
        assert_eq!(leaf.range_count(), 2);
    }

    #[test]
    fn test_concurrent_writes_cover_everything() {
        let leaf = Arc::new(LeafWithNoDescriptors::with_id(1));
        let mut handles = vec![];

        for t in 0..4u64 {
            let bound = leaf.bounded_descriptor();
            handles.push(thread::spawn(move || {
                for i in 0..250u64 {
                    let slot = i * 4 + t;
                    bound.set_position_and_size(slot * 16, 16).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        leaf.pre_write_finalization();

        assert_eq!(leaf.ranges(), vec![SimpleStorageDescriptor::new(0, 16_000)]);
        assert_eq!(leaf.query(&BasicIndexQuery::new()).len(), 1);
    }

    #[test]
    fn test_loaded_range_leaf_reserves_its_id() {
        let persisted_id = i32::MIN + 23;
        let leaf = LeafWithNoDescriptors::with_id(persisted_id);
        leaf.set_position_and_size(0, 64);

        let loaded = LeafWithNoDescriptors::from_image(leaf.image()).unwrap();
        assert_eq!(loaded.id(), persisted_id);
        assert_eq!(loaded.range_count(), 1);
        assert!(crate::index::leaf_id::is_leaf_id_taken(persisted_id));
    }
}
