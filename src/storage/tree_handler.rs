//! Indexing tree handler
//!
//! Sits between a storage writer and the indexing tree. Every write task is
//! indexed before its bytes are written (`start_write` hands back the channel
//! to write to) and reported afterwards (`write_successful` / `write_failed`).
//!
//! When the live tree grows past `maximum_tree_size` it is retired and a fresh
//! one takes its place. A retired tree is saved once every task that was in
//! flight at rotation time has been reported, so no saved tree is missing a
//! descriptor update.

use super::persistence::{random_index_file_name, save_tree};
use crate::config::IndexingConfig;
use crate::index::{BoundDescriptor, ObjectSizes, StorageTreeComponent, TreeNode, TreeTemplate};
use crate::types::IndexedElement;
use crate::{Result, StorageError};
use ahash::AHashSet;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Identifier of one write task, unique while the task is in flight
pub type TaskId = u64;

struct InFlightWrite<E> {
    element: E,
    tree: Arc<TreeNode>,
    descriptor: BoundDescriptor,
}

struct RetiredTree {
    tree: Arc<TreeNode>,
    waiting_on: AHashSet<TaskId>,
}

pub struct IndexingTreeHandler<E: IndexedElement> {
    config: IndexingConfig,
    template: TreeTemplate,
    sizes: ObjectSizes,
    index_dir: PathBuf,
    /// Live tree; `None` before `prepare` and after `finish`
    current: RwLock<Option<Arc<TreeNode>>>,
    in_flight: DashMap<TaskId, InFlightWrite<E>>,
    retired: Mutex<Vec<RetiredTree>>,
}

impl<E: IndexedElement> IndexingTreeHandler<E> {
    pub fn new(
        config: IndexingConfig,
        template: TreeTemplate,
        index_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let index_dir = index_dir.into();
        std::fs::create_dir_all(&index_dir)?;

        Ok(Self {
            config,
            template,
            sizes: ObjectSizes::native(),
            index_dir,
            current: RwLock::new(None),
            in_flight: DashMap::new(),
            retired: Mutex::new(Vec::new()),
        })
    }

    /// Use a different object size model for rotation estimates
    pub fn with_object_sizes(mut self, sizes: ObjectSizes) -> Self {
        self.sizes = sizes;
        self
    }

    /// Install a fresh tree
    pub fn prepare(&self) -> Result<()> {
        let tree = Arc::new(self.template.build(&self.config)?);
        tracing::info!(kind = tree.kind_name(), dir = %self.index_dir.display(), "indexing tree handler prepared");
        *self.current.write() = Some(tree);
        Ok(())
    }

    /// Index `element` for task `task_id` and return the channel id its bytes go to.
    ///
    /// Fails with `Indexing` if `task_id` is already in flight; nothing is put then.
    pub fn start_write(&self, task_id: TaskId, element: E) -> Result<i32> {
        // Held across put and registration so rotation sees either both or neither
        let current = self.current.read();
        let tree = current.as_ref().ok_or_else(|| {
            StorageError::Indexing("Indexing tree handler has no active tree".into())
        })?;

        match self.in_flight.entry(task_id) {
            Entry::Occupied(_) => {
                tracing::warn!(task_id, "write task already in flight");
                Err(StorageError::Indexing(format!(
                    "Write task {} is already in flight",
                    task_id
                )))
            }
            Entry::Vacant(slot) => {
                let descriptor = tree.put(&element)?;
                let channel_id = descriptor.channel_id();
                slot.insert(InFlightWrite {
                    element,
                    tree: Arc::clone(tree),
                    descriptor,
                });
                Ok(channel_id)
            }
        }
    }

    /// Record where the bytes of task `task_id` were written
    pub fn write_successful(&self, task_id: TaskId, position: u64, size: u32) -> Result<()> {
        let result = match self.in_flight.get(&task_id) {
            Some(write) => write.descriptor.set_position_and_size(position, size),
            None => {
                tracing::warn!(task_id, "write reported for unknown task");
                Ok(())
            }
        };
        self.in_flight.remove(&task_id);
        result
    }

    /// Remove the element of a failed task from the tree it was indexed in
    pub fn write_failed(&self, task_id: TaskId) -> Result<()> {
        let result = match self.in_flight.get(&task_id) {
            Some(write) => {
                write.descriptor.mark_failed();
                write.tree.get_and_remove(&write.element).map(|_| ())
            }
            None => {
                tracing::warn!(task_id, "failure reported for unknown task");
                Ok(())
            }
        };
        self.in_flight.remove(&task_id);
        result
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    pub fn current_tree(&self) -> Option<Arc<TreeNode>> {
        self.current.read().clone()
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Retire the live tree if it grew past the configured maximum.
    ///
    /// Returns true when a rotation happened.
    pub fn rotate_if_needed(&self) -> Result<bool> {
        let Some(tree) = self.current_tree() else {
            return Ok(false);
        };
        let tree_size = tree.component_size(&self.sizes);
        if tree_size <= self.config.maximum_tree_size {
            return Ok(false);
        }

        let fresh = Arc::new(self.template.build(&self.config)?);
        let mut current = self.current.write();
        match current.as_ref() {
            Some(live) if Arc::ptr_eq(live, &tree) => {}
            // Rotated or finished by someone else meanwhile
            _ => return Ok(false),
        }

        *current = Some(fresh);
        let waiting_on: AHashSet<TaskId> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        drop(current);

        tracing::info!(
            tree_size,
            maximum = self.config.maximum_tree_size,
            waiting_on = waiting_on.len(),
            "rotating indexing tree"
        );
        self.retired.lock().push(RetiredTree { tree, waiting_on });
        Ok(true)
    }

    /// Finalize and save every retired tree whose tasks have all been reported
    pub fn save_ready_trees(&self) -> Result<Vec<PathBuf>> {
        let ready: Vec<RetiredTree> = {
            let mut retired = self.retired.lock();
            let (ready, waiting): (Vec<RetiredTree>, Vec<RetiredTree>) = retired
                .drain(..)
                .partition(|r| r.waiting_on.iter().all(|id| !self.in_flight.contains_key(id)));
            *retired = waiting;
            ready
        };

        self.save_all(ready)
    }

    /// Detach the live tree, wait for in-flight tasks, and save every remaining tree.
    ///
    /// Waiting is bounded by `finish_wait_iterations` sleeps of
    /// `finish_wait_millis`; after that trees are saved anyway.
    pub fn finish(&self) -> Result<Vec<PathBuf>> {
        let current = self.current.write().take();

        let mut sleep_count = 0;
        while !self.in_flight.is_empty() {
            if sleep_count >= self.config.finish_wait_iterations {
                tracing::warn!(
                    waited_ms = u64::from(sleep_count) * self.config.finish_wait_millis,
                    in_flight = self.in_flight.len(),
                    "saving indexing trees without waiting for remaining tasks"
                );
                break;
            }
            tracing::info!(
                in_flight = self.in_flight.len(),
                attempt = sleep_count + 1,
                of = self.config.finish_wait_iterations,
                "waiting for write tasks before saving indexing tree"
            );
            std::thread::sleep(Duration::from_millis(self.config.finish_wait_millis));
            sleep_count += 1;
        }

        let mut trees: Vec<RetiredTree> = self.retired.lock().drain(..).collect();
        if let Some(tree) = current {
            trees.push(RetiredTree {
                tree,
                waiting_on: AHashSet::new(),
            });
        }
        self.save_all(trees)
    }

    /// Save `trees`; ones that fail stay retired for a later attempt
    fn save_all(&self, trees: Vec<RetiredTree>) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(trees.len());
        let mut first_error = None;

        for retired in trees {
            retired.tree.pre_write_finalization();
            let path = self.index_dir.join(random_index_file_name());
            match save_tree(&path, &retired.tree) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "indexing tree saved");
                    written.push(path);
                }
                Err(err) => {
                    tracing::error!(error = %err, "indexing tree saving failed, tree kept for retry");
                    self.retired.lock().push(retired);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BasicIndexQuery, IndexerKind, StorageBranchIndexer};
    use crate::storage::persistence::{load_combined, load_tree};
    use crate::types::RecordInfo;
    use tempfile::TempDir;

    fn handler(dir: &Path, config: IndexingConfig) -> IndexingTreeHandler<RecordInfo> {
        let template = TreeTemplate::Branch(StorageBranchIndexer::new(IndexerKind::PlatformIdent));
        let handler = IndexingTreeHandler::new(config, template, dir).unwrap();
        handler.prepare().unwrap();
        handler
    }

    fn record(id: i64) -> RecordInfo {
        RecordInfo::new(id, "timer").with_platform(1)
    }

    #[test]
    fn test_write_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path(), IndexingConfig::for_testing());

        let channel = handler.start_write(1, record(10)).unwrap();
        handler.start_write(2, record(11)).unwrap();
        assert_eq!(handler.in_flight_count(), 2);

        handler.write_successful(1, 0, 40).unwrap();
        handler.write_failed(2).unwrap();
        assert_eq!(handler.in_flight_count(), 0);

        let tree = handler.current_tree().unwrap();
        let found = tree.get(&record(10)).unwrap().unwrap();
        assert_eq!(found.channel_id(), channel);
        assert_eq!((found.position(), found.size()), (0, 40));
        assert!(tree.get(&record(11)).unwrap().is_none());
    }

    #[test]
    fn test_start_write_without_tree() {
        let temp_dir = TempDir::new().unwrap();
        let handler: IndexingTreeHandler<RecordInfo> = IndexingTreeHandler::new(
            IndexingConfig::for_testing(),
            TreeTemplate::PreciseLeaf,
            temp_dir.path(),
        )
        .unwrap();

        let err = handler.start_write(1, record(1)).unwrap_err();
        assert!(err.is_indexing());
        assert_eq!(handler.in_flight_count(), 0);
    }

    #[test]
    fn test_failed_put_is_not_tracked() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path(), IndexingConfig::for_testing());

        // Platform indexer can not route a record without a platform
        let err = handler.start_write(1, RecordInfo::new(5, "timer")).unwrap_err();
        assert!(err.is_indexing());
        assert_eq!(handler.in_flight_count(), 0);
    }

    #[test]
    fn test_duplicate_task_id_refused() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path(), IndexingConfig::for_testing());

        handler.start_write(1, record(10)).unwrap();
        let err = handler.start_write(1, record(11)).unwrap_err();
        assert!(err.is_indexing());
        assert_eq!(handler.in_flight_count(), 1);

        // The second element was never indexed; the first task still completes
        let tree = handler.current_tree().unwrap();
        assert!(tree.get(&record(11)).unwrap().is_none());
        handler.write_successful(1, 0, 16).unwrap();
        let found = tree.get(&record(10)).unwrap().unwrap();
        assert_eq!((found.position(), found.size()), (0, 16));
    }

    #[test]
    fn test_zero_bucket_width_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = IndexingConfig {
            timestamp_bucket_millis: 0,
            ..IndexingConfig::for_testing()
        };
        let result: Result<IndexingTreeHandler<RecordInfo>> =
            IndexingTreeHandler::new(config, TreeTemplate::default_storage(), temp_dir.path());
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }

    #[test]
    fn test_unknown_task_reports_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path(), IndexingConfig::for_testing());
        handler.write_successful(99, 0, 1).unwrap();
        handler.write_failed(98).unwrap();
    }

    #[test]
    fn test_rotation_waits_for_in_flight_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let config = IndexingConfig {
            maximum_tree_size: 1,
            ..IndexingConfig::for_testing()
        };
        let handler = handler(temp_dir.path(), config);

        handler.start_write(1, record(1)).unwrap();
        let old_tree = handler.current_tree().unwrap();

        assert!(handler.rotate_if_needed().unwrap());
        assert!(!Arc::ptr_eq(&old_tree, &handler.current_tree().unwrap()));
        assert_eq!(handler.retired_count(), 1);

        // Task 1 still in flight against the retired tree
        assert!(handler.save_ready_trees().unwrap().is_empty());
        assert_eq!(handler.retired_count(), 1);

        handler.write_successful(1, 100, 10).unwrap();
        let saved = handler.save_ready_trees().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(handler.retired_count(), 0);

        let loaded = load_tree(&saved[0]).unwrap();
        let found = loaded.get(&record(1)).unwrap().unwrap();
        assert_eq!((found.position(), found.size()), (100, 10));
    }

    #[test]
    fn test_no_rotation_below_maximum() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path(), IndexingConfig::for_testing());
        handler.start_write(1, record(1)).unwrap();
        assert!(!handler.rotate_if_needed().unwrap());
        assert_eq!(handler.retired_count(), 0);
    }

    #[test]
    fn test_finish_saves_all_trees() {
        let temp_dir = TempDir::new().unwrap();
        let config = IndexingConfig {
            maximum_tree_size: 1,
            ..IndexingConfig::for_testing()
        };
        let handler = handler(temp_dir.path(), config);

        handler.start_write(1, record(1)).unwrap();
        handler.write_successful(1, 0, 10).unwrap();
        assert!(handler.rotate_if_needed().unwrap());
        handler.start_write(2, record(2)).unwrap();
        handler.write_successful(2, 10, 10).unwrap();

        let saved = handler.finish().unwrap();
        assert_eq!(saved.len(), 2);
        assert!(handler.current_tree().is_none());
        assert!(handler.start_write(3, record(3)).is_err());

        let combined = load_combined(temp_dir.path()).unwrap();
        assert_eq!(combined.len(), 2);
        assert!(combined.get(&record(1)).unwrap().is_some());
        assert!(combined.get(&record(2)).unwrap().is_some());
        assert_eq!(combined.query(&BasicIndexQuery::new()).len(), 2);
    }

    #[test]
    fn test_finish_gives_up_on_stuck_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let handler = handler(temp_dir.path(), IndexingConfig::for_testing());

        handler.start_write(1, record(1)).unwrap();
        let saved = handler.finish().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(handler.in_flight_count(), 1);
    }

    #[test]
    fn test_concurrent_writers() {
        let temp_dir = TempDir::new().unwrap();
        let handler = Arc::new(handler(temp_dir.path(), IndexingConfig::for_testing()));

        let mut handles = vec![];
        for t in 0..4i64 {
            let handler = Arc::clone(&handler);
            handles.push(std::thread::spawn(move || {
                for i in 0..250i64 {
                    let id = t * 1000 + i + 1;
                    let task = id as TaskId;
                    handler
                        .start_write(task, RecordInfo::new(id, "timer").with_platform(t))
                        .unwrap();
                    if i % 10 == 0 {
                        handler.write_failed(task).unwrap();
                    } else {
                        handler.write_successful(task, id as u64 * 8, 8).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(handler.in_flight_count(), 0);
        let tree = handler.current_tree().unwrap();
        assert_eq!(tree.query(&BasicIndexQuery::new()).len(), 4 * 225);
    }
}
