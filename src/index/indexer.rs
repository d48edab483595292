//! Branch indexers
//!
//! An indexer derives the routing key of an element for one tree level and
//! tells a branch which children a query has to visit. A
//! [`StorageBranchIndexer`] chains indexers level by level and decides what
//! kind of component a branch creates for a new key.

use super::array_leaf::ArrayBasedStorageLeaf;
use super::branch::StorageBranch;
use super::leaf_id::next_leaf_id;
use super::query::IndexQuery;
use super::range_leaf::LeafWithNoDescriptors;
use super::TreeNode;
use crate::config::{IndexingConfig, DEFAULT_LEAF_CAPACITY, DEFAULT_TIMESTAMP_BUCKET_MILLIS, MAX_RANGE_SIZE};
use crate::types::IndexedElement;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Routing key of a branch child
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexKey {
    /// Platform, sensor type or method ident
    Ident(i64),
    /// Record kind
    TypeName(String),
    /// Timestamp bucket number
    Bucket(i64),
}

/// Children a query has to visit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelection {
    All,
    Keys(Vec<IndexKey>),
    /// Inclusive bucket bounds; an open side is unbounded
    BucketRange { min: Option<i64>, max: Option<i64> },
}

impl KeySelection {
    pub fn matches(&self, key: &IndexKey) -> bool {
        match self {
            KeySelection::All => true,
            KeySelection::Keys(keys) => keys.contains(key),
            KeySelection::BucketRange { min, max } => match key {
                IndexKey::Bucket(bucket) => {
                    min.map_or(true, |min| *bucket >= min) && max.map_or(true, |max| *bucket <= max)
                }
                _ => false,
            },
        }
    }
}

/// Attribute a tree level is keyed by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerKind {
    PlatformIdent,
    SensorTypeIdent,
    MethodIdent,
    ObjectType,
    Timestamp { bucket_millis: i64 },
}

impl IndexerKind {
    /// Timestamp indexer with the default bucket width
    pub fn timestamp() -> Self {
        IndexerKind::Timestamp {
            bucket_millis: DEFAULT_TIMESTAMP_BUCKET_MILLIS,
        }
    }

    /// Routing key of `element`, `None` if it lacks the attribute
    pub fn key<E: IndexedElement + ?Sized>(&self, element: &E) -> Option<IndexKey> {
        match self {
            IndexerKind::PlatformIdent => element.platform_ident().map(IndexKey::Ident),
            IndexerKind::SensorTypeIdent => element.sensor_type_ident().map(IndexKey::Ident),
            IndexerKind::MethodIdent => element.method_ident().map(IndexKey::Ident),
            IndexerKind::ObjectType => Some(IndexKey::TypeName(element.type_name().to_string())),
            IndexerKind::Timestamp { bucket_millis } => element
                .timestamp_millis()
                .and_then(|millis| bucket_of(millis, *bucket_millis))
                .map(IndexKey::Bucket),
        }
    }

    /// Children the query restricts this level to
    pub fn selection(&self, query: &dyn IndexQuery) -> KeySelection {
        let single = |ident: Option<i64>| match ident {
            Some(ident) => KeySelection::Keys(vec![IndexKey::Ident(ident)]),
            None => KeySelection::All,
        };

        match self {
            IndexerKind::PlatformIdent => single(query.platform_ident()),
            IndexerKind::SensorTypeIdent => single(query.sensor_type_ident()),
            IndexerKind::MethodIdent => single(query.method_ident()),
            IndexerKind::ObjectType => match query.object_types() {
                Some(types) => KeySelection::Keys(
                    types.iter().cloned().map(IndexKey::TypeName).collect(),
                ),
                None => KeySelection::All,
            },
            IndexerKind::Timestamp { bucket_millis } => {
                let (from, to) = (query.from_date(), query.to_date());
                if (from.is_none() && to.is_none()) || *bucket_millis <= 0 {
                    KeySelection::All
                } else {
                    KeySelection::BucketRange {
                        min: from.and_then(|millis| bucket_of(millis, *bucket_millis)),
                        max: to.and_then(|millis| bucket_of(millis, *bucket_millis)),
                    }
                }
            }
        }
    }
}

/// Bucket number of `millis`; `None` for a non-positive bucket width
fn bucket_of(millis: i64, bucket_millis: i64) -> Option<i64> {
    if bucket_millis <= 0 {
        return None;
    }
    millis.checked_div_euclid(bucket_millis)
}

/// Leaf representation created at the bottom level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafKind {
    /// [`ArrayBasedStorageLeaf`]: per record descriptors, point lookups
    Precise,
    /// [`LeafWithNoDescriptors`]: merged byte ranges, bulk reads only
    Ranged,
}

/// Indexer of one branch level plus the recipe for its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageBranchIndexer {
    kind: IndexerKind,
    child: Option<Box<StorageBranchIndexer>>,
    leaf_kind: LeafKind,
    /// Leaves created by this indexer share `shared_leaf_id`
    pass_id: bool,
    shared_leaf_id: i32,
    leaf_capacity: usize,
    max_range_size: u64,
}

impl StorageBranchIndexer {
    /// Bottom level indexer creating precise leaves
    pub fn new(kind: IndexerKind) -> Self {
        Self {
            kind,
            child: None,
            leaf_kind: LeafKind::Precise,
            pass_id: false,
            shared_leaf_id: 0,
            leaf_capacity: DEFAULT_LEAF_CAPACITY,
            max_range_size: MAX_RANGE_SIZE,
        }
    }

    /// Create a child branch keyed by `child` for every new key instead of a leaf
    pub fn with_child(mut self, child: StorageBranchIndexer) -> Self {
        self.child = Some(Box::new(child));
        self
    }

    pub fn with_leaf_kind(mut self, leaf_kind: LeafKind) -> Self {
        self.leaf_kind = leaf_kind;
        self
    }

    /// Let every leaf created by this indexer use one shared id (one channel)
    pub fn passing_id(mut self) -> Self {
        self.pass_id = true;
        self.shared_leaf_id = next_leaf_id();
        self
    }

    /// Apply leaf sizing and bucket width from `config` to this level and all below
    pub fn configured(mut self, config: &IndexingConfig) -> Self {
        self.leaf_capacity = config.initial_leaf_capacity;
        self.max_range_size = config.max_range_size;
        if let IndexerKind::Timestamp { bucket_millis } = &mut self.kind {
            *bucket_millis = config.timestamp_bucket_millis;
        }
        self.child = self.child.map(|child| Box::new(child.configured(config)));
        self
    }

    pub fn kind(&self) -> &IndexerKind {
        &self.kind
    }

    pub fn child(&self) -> Option<&StorageBranchIndexer> {
        self.child.as_deref()
    }

    pub fn leaf_kind(&self) -> LeafKind {
        self.leaf_kind
    }

    pub fn pass_id(&self) -> bool {
        self.pass_id
    }

    pub fn shared_leaf_id(&self) -> Option<i32> {
        self.pass_id.then_some(self.shared_leaf_id)
    }

    pub fn key<E: IndexedElement + ?Sized>(&self, element: &E) -> Option<IndexKey> {
        self.kind.key(element)
    }

    pub fn selection(&self, query: &dyn IndexQuery) -> KeySelection {
        self.kind.selection(query)
    }

    /// Copy of this indexer for a new branch; a shared leaf id is drawn again
    pub fn new_instance(&self) -> Self {
        let mut instance = self.clone();
        if instance.pass_id {
            instance.shared_leaf_id = next_leaf_id();
        }
        instance
    }

    /// Component a branch creates for a key it has not seen yet
    pub fn next_component(&self) -> TreeNode {
        if let Some(child) = &self.child {
            return TreeNode::Branch(StorageBranch::new(child.new_instance()));
        }

        let leaf_id = if self.pass_id {
            self.shared_leaf_id
        } else {
            next_leaf_id()
        };
        match self.leaf_kind {
            LeafKind::Precise => TreeNode::Leaf(ArrayBasedStorageLeaf::with_id_and_capacity(
                leaf_id,
                self.leaf_capacity,
            )),
            LeafKind::Ranged => TreeNode::RangeLeaf(LeafWithNoDescriptors::with_id_and_max_range(
                leaf_id,
                self.max_range_size,
            )),
        }
    }
}

/// Recipe for a fresh, empty indexing tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeTemplate {
    PreciseLeaf,
    RangeLeaf,
    Branch(StorageBranchIndexer),
}

impl TreeTemplate {
    /// Platform ident, then sensor type, then timestamp bucket, precise leaves
    pub fn default_storage() -> Self {
        let timestamp = StorageBranchIndexer::new(IndexerKind::timestamp());
        let sensor_type = StorageBranchIndexer::new(IndexerKind::SensorTypeIdent).with_child(timestamp);
        TreeTemplate::Branch(StorageBranchIndexer::new(IndexerKind::PlatformIdent).with_child(sensor_type))
    }

    /// Fresh tree for `config`; fails with `InvalidConfig` if the config does not validate
    pub fn build(&self, config: &IndexingConfig) -> Result<TreeNode> {
        config.validate()?;
        Ok(match self {
            TreeTemplate::PreciseLeaf => TreeNode::Leaf(ArrayBasedStorageLeaf::with_id_and_capacity(
                next_leaf_id(),
                config.initial_leaf_capacity,
            )),
            TreeTemplate::RangeLeaf => TreeNode::RangeLeaf(LeafWithNoDescriptors::with_id_and_max_range(
                next_leaf_id(),
                config.max_range_size,
            )),
            TreeTemplate::Branch(indexer) => TreeNode::Branch(StorageBranch::new(
                indexer.clone().configured(config).new_instance(),
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::query::BasicIndexQuery;
    use crate::types::RecordInfo;

    #[test]
    fn test_keys_follow_element_attributes() {
        let record = RecordInfo::new(1, "sql")
            .with_platform(10)
            .with_sensor_type(20)
            .with_timestamp(3_600_000);

        assert_eq!(IndexerKind::PlatformIdent.key(&record), Some(IndexKey::Ident(10)));
        assert_eq!(IndexerKind::SensorTypeIdent.key(&record), Some(IndexKey::Ident(20)));
        assert_eq!(IndexerKind::MethodIdent.key(&record), None);
        assert_eq!(IndexerKind::ObjectType.key(&record), Some(IndexKey::TypeName("sql".into())));
        assert_eq!(
            IndexerKind::Timestamp { bucket_millis: 60_000 }.key(&record),
            Some(IndexKey::Bucket(60))
        );
    }

    #[test]
    fn test_negative_timestamps_bucket_downwards() {
        let record = RecordInfo::new(1, "timer").with_timestamp(-1);
        assert_eq!(
            IndexerKind::Timestamp { bucket_millis: 1000 }.key(&record),
            Some(IndexKey::Bucket(-1))
        );
    }

    #[test]
    fn test_selection_from_query() {
        let query = BasicIndexQuery::new().with_platform(10).with_time_range(Some(5_000), None);

        assert_eq!(
            IndexerKind::PlatformIdent.selection(&query),
            KeySelection::Keys(vec![IndexKey::Ident(10)])
        );
        assert_eq!(IndexerKind::MethodIdent.selection(&query), KeySelection::All);

        let buckets = IndexerKind::Timestamp { bucket_millis: 1000 }.selection(&query);
        assert!(!buckets.matches(&IndexKey::Bucket(4)));
        assert!(buckets.matches(&IndexKey::Bucket(5)));
        assert!(buckets.matches(&IndexKey::Bucket(500)));
        assert!(!buckets.matches(&IndexKey::Ident(5)));
    }

    #[test]
    fn test_pass_id_shares_leaf_id() {
        let indexer = StorageBranchIndexer::new(IndexerKind::PlatformIdent).passing_id();
        let shared = indexer.shared_leaf_id().unwrap();

        let ids: Vec<i32> = (0..3)
            .map(|_| match indexer.next_component() {
                TreeNode::Leaf(leaf) => leaf.id(),
                other => panic!("unexpected component {:?}", other),
            })
            .collect();
        assert!(ids.iter().all(|id| *id == shared));

        let instance = indexer.new_instance();
        assert!(instance.pass_id());
        assert_ne!(instance.shared_leaf_id(), Some(shared));
    }

    #[test]
    fn test_configured_applies_to_every_level() {
        let config = IndexingConfig {
            initial_leaf_capacity: 4,
            timestamp_bucket_millis: 500,
            ..Default::default()
        };
        let indexer = StorageBranchIndexer::new(IndexerKind::PlatformIdent)
            .with_child(StorageBranchIndexer::new(IndexerKind::timestamp()).with_leaf_kind(LeafKind::Ranged))
            .configured(&config);

        let child = indexer.child().unwrap();
        assert_eq!(child.kind(), &IndexerKind::Timestamp { bucket_millis: 500 });
        assert_eq!(child.leaf_kind(), LeafKind::Ranged);
        match StorageBranchIndexer::new(IndexerKind::ObjectType).configured(&config).next_component() {
            TreeNode::Leaf(leaf) => assert_eq!(leaf.capacity(), 4),
            other => panic!("unexpected component {:?}", other),
        }
    }

    #[test]
    fn test_zero_bucket_width_rejected_by_build() {
        let config = IndexingConfig {
            timestamp_bucket_millis: 0,
            ..Default::default()
        };
        let result = TreeTemplate::default_storage().build(&config);
        assert!(matches!(result, Err(crate::StorageError::InvalidConfig(_))));
        assert!(TreeTemplate::PreciseLeaf.build(&config).is_err());
    }

    #[test]
    fn test_non_positive_bucket_width_yields_no_key() {
        let record = RecordInfo::new(1, "timer").with_timestamp(10_000);
        assert_eq!(IndexerKind::Timestamp { bucket_millis: 0 }.key(&record), None);
        assert_eq!(IndexerKind::Timestamp { bucket_millis: -5 }.key(&record), None);

        let query = BasicIndexQuery::new().with_time_range(Some(0), Some(10_000));
        assert_eq!(
            IndexerKind::Timestamp { bucket_millis: 0 }.selection(&query),
            KeySelection::All
        );

        // A branch built directly with a zero width refuses the put instead of panicking
        let branch = StorageBranch::new(StorageBranchIndexer::new(IndexerKind::Timestamp { bucket_millis: 0 }));
        let err = crate::index::StorageTreeComponent::put(&branch, &record).unwrap_err();
        assert!(err.is_indexing());
    }
}
