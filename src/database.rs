//! # Database Registry
//!
//! The mutable heart of the system, owned exclusively by the coordinator
//! thread: the published dataset list, the iterator registry, the config,
//! the active task table and the retained snapshots. Workers never touch
//! this type; they see frozen [`DatabaseSnapshot`]s and everything else
//! travels through the message protocol.
//!
//! ## Commit Discipline
//!
//! `commit_task` applies a task's staged changes as an all-or-nothing unit:
//! the changes are replayed against a scratch copy of the registry state and
//! the copy is swapped in only if every change applies cleanly. A rejected
//! commit leaves the registry exactly as it was.
//!
//! ## Snapshot Retention
//!
//! Every snapshot handed out is retained here until garbage collection
//! observes that no active task references its generation. The reference
//! graph is acyclic (task → snapshot → data), so plain `Arc` counting plus
//! the retained list is enough; no cycle collector needed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::iterator::ITERMETA_NAMESPACE;
use crate::snapshot::DatabaseSnapshot;
use crate::types::{DatabaseName, DatasetId, DbChange, IteratorId, Task, TaskId, TaskSpec};

// =============================================================================
// Database
// =============================================================================

/// Registry of published state plus task and snapshot bookkeeping.
#[derive(Debug)]
pub struct Database {
    directory: PathBuf,
    config: DatabaseConfig,
    datasets: Vec<Arc<Dataset>>,
    iterators: HashMap<IteratorId, DatabaseName>,
    tasks: BTreeMap<TaskId, TaskSpec>,
    next_task_id: TaskId,
    next_generation: u64,
    retained: Vec<Arc<DatabaseSnapshot>>,
}

impl Database {
    /// Opens (or creates) a database directory.
    ///
    /// Iterators are rediscovered from their metadata files, so cursors
    /// survive a restart. Dataset content storage is the storage engine's
    /// concern; this registry starts empty.
    pub fn open(directory: &Path) -> Result<Self> {
        fs::create_dir_all(directory)?;

        let mut iterators = HashMap::new();
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let filename = entry.file_name();
            let Some(name) = DatabaseName::from_filename(&filename.to_string_lossy()) else {
                continue;
            };
            if name.namespace() == ITERMETA_NAMESPACE {
                iterators.insert(IteratorId::new(name.id()), name);
            }
        }

        info!(
            directory = %directory.display(),
            iterators = iterators.len(),
            "database opened"
        );

        Ok(Self {
            directory: directory.to_path_buf(),
            config: DatabaseConfig::new(),
            datasets: Vec::new(),
            iterators,
            tasks: BTreeMap::new(),
            next_task_id: TaskId::from_raw(1),
            next_generation: 1,
            retained: Vec::new(),
        })
    }

    /// The database's on-disk directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Current configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Takes a new snapshot of the current state and retains it.
    pub fn snapshot(&mut self) -> Arc<DatabaseSnapshot> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let snap = Arc::new(DatabaseSnapshot::new(
            generation,
            self.directory.clone(),
            self.datasets.clone(),
            self.iterators.clone(),
            self.config.clone(),
            self.tasks.values().cloned().collect(),
        ));
        self.retained.push(Arc::clone(&snap));
        snap
    }

    /// Drops every retained snapshot whose generation is not in the working
    /// set.
    pub fn collect_garbage(&mut self, working: &HashSet<u64>) {
        let before = self.retained.len();
        self.retained.retain(|snap| working.contains(&snap.generation()));
        let collected = before - self.retained.len();
        if collected > 0 {
            debug!(collected, retained = self.retained.len(), "snapshot gc");
        }
    }

    /// Number of snapshots currently retained.
    pub fn retained_snapshots(&self) -> usize {
        self.retained.len()
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Allocates a task with a fresh monotonic id and registers it as
    /// active.
    pub fn allocate_task(&mut self, request: &str, client_addr: &str) -> Task {
        let id = self.next_task_id;
        self.next_task_id = id.next();

        let task = Task::new(id, request, client_addr);
        self.tasks.insert(id, task.spec().clone());
        task
    }

    /// Commits a finished task: applies its staged changes atomically and
    /// removes it from the active table.
    ///
    /// On rejection the staged changes are discarded wholesale and the
    /// registry is untouched (the task is still retired; its outcome was
    /// already reported to the client).
    pub fn commit_task(&mut self, task: Task) -> Result<()> {
        let task_id = task.id();
        self.tasks.remove(&task_id);

        // Replay onto scratch copies; swap in only on full success.
        let mut datasets = self.datasets.clone();
        let mut iterators = self.iterators.clone();
        let mut config = self.config.clone();

        for change in task.into_changes() {
            apply_change(&mut datasets, &mut iterators, &mut config, change)?;
        }

        self.datasets = datasets;
        self.iterators = iterators;
        self.config = config;
        Ok(())
    }

    /// Number of tasks currently active.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }
}

fn apply_change(
    datasets: &mut Vec<Arc<Dataset>>,
    iterators: &mut HashMap<IteratorId, DatabaseName>,
    config: &mut DatabaseConfig,
    change: DbChange,
) -> Result<()> {
    match change {
        DbChange::NewDataset(dataset) => {
            datasets.push(Arc::new(dataset));
        }
        DbChange::NewIterator(meta_name) => {
            iterators.insert(IteratorId::new(meta_name.id()), meta_name);
        }
        DbChange::ConfigChange { key, value } => {
            config.set(&key, value);
        }
        DbChange::ToggleTaint { dataset, taint } => {
            let slot = find_dataset_mut(datasets, &dataset)?;
            *slot = Arc::new(slot.with_taint_toggled(&taint));
        }
        DbChange::Drop(dataset) => {
            let position = datasets
                .iter()
                .position(|ds| ds.id() == &dataset)
                .ok_or_else(|| Error::UnknownDataset(dataset.as_str().to_string()))?;
            datasets.remove(position);
        }
    }
    Ok(())
}

fn find_dataset_mut<'a>(
    datasets: &'a mut [Arc<Dataset>],
    id: &DatasetId,
) -> Result<&'a mut Arc<Dataset>> {
    datasets
        .iter_mut()
        .find(|ds| ds.id() == id)
        .ok_or_else(|| Error::UnknownDataset(id.as_str().to_string()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::IndexRef;
    use crate::iterator::ITERATOR_NAMESPACE;
    use crate::types::IndexType;
    use std::collections::BTreeSet;

    fn dataset(id: &str) -> Dataset {
        Dataset::new(
            DatasetId::new(id),
            vec![],
            BTreeSet::new(),
            vec![IndexRef {
                index_type: IndexType::Gram3,
                size: 1,
            }],
        )
    }

    #[test]
    fn test_task_ids_are_monotonic() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = Database::open(dir.path()).unwrap();

        let t1 = db.allocate_task("ping;", "aa");
        let t2 = db.allocate_task("ping;", "bb");
        assert!(t1.id() < t2.id());
        assert_eq!(db.active_tasks(), 2);
    }

    #[test]
    fn test_commit_applies_changes_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = Database::open(dir.path()).unwrap();

        // Publish set_a.
        let mut task = db.allocate_task("index;", "aa");
        task.change(DbChange::NewDataset(dataset("set_a")));
        db.commit_task(task).unwrap();

        // Swap it for set_b, staged as publish-then-drop.
        let mut task = db.allocate_task("reindex;", "aa");
        task.change(DbChange::NewDataset(dataset("set_b")));
        task.change(DbChange::Drop(DatasetId::new("set_a")));
        db.commit_task(task).unwrap();

        let snap = db.snapshot();
        let ids: Vec<&str> = snap.get_datasets().iter().map(|ds| ds.id().as_str()).collect();
        assert_eq!(ids, vec!["set_b"]);
    }

    #[test]
    fn test_commit_rejection_leaves_state_untouched() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = Database::open(dir.path()).unwrap();

        let mut task = db.allocate_task("index;", "aa");
        task.change(DbChange::NewDataset(dataset("set_a")));
        db.commit_task(task).unwrap();

        // Publish set_c, then drop something that isn't there: the whole
        // commit must be rejected, including the publish.
        let mut task = db.allocate_task("bad;", "aa");
        task.change(DbChange::NewDataset(dataset("set_c")));
        task.change(DbChange::Drop(DatasetId::new("set_missing")));
        let err = db.commit_task(task).unwrap_err();
        assert!(matches!(err, Error::UnknownDataset(_)));

        let snap = db.snapshot();
        let ids: Vec<&str> = snap.get_datasets().iter().map(|ds| ds.id().as_str()).collect();
        assert_eq!(ids, vec!["set_a"]);
        // The rejected task is still retired.
        assert_eq!(db.active_tasks(), 0);
    }

    #[test]
    fn test_commit_invisible_to_older_snapshots() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = Database::open(dir.path()).unwrap();

        let old_snap = db.snapshot();

        let mut task = db.allocate_task("index;", "aa");
        task.change(DbChange::NewDataset(dataset("set_a")));
        db.commit_task(task).unwrap();

        assert!(old_snap.get_datasets().is_empty());
        assert_eq!(db.snapshot().get_datasets().len(), 1);
    }

    #[test]
    fn test_snapshot_gc_retires_unreferenced() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut db = Database::open(dir.path()).unwrap();

        let s1 = db.snapshot();
        let _s2 = db.snapshot();
        let s3 = db.snapshot();
        assert_eq!(db.retained_snapshots(), 3);

        let working: HashSet<u64> = [s1.generation(), s3.generation()].into_iter().collect();
        db.collect_garbage(&working);
        assert_eq!(db.retained_snapshots(), 2);

        db.collect_garbage(&HashSet::new());
        assert_eq!(db.retained_snapshots(), 0);
    }

    #[test]
    fn test_iterators_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();

        // Fabricate an iterator pair on disk.
        let data_name = DatabaseName::allocate(ITERATOR_NAMESPACE);
        let meta_name = data_name.derive(ITERMETA_NAMESPACE);
        fs::write(data_name.full_path(dir.path()), "a\n").unwrap();
        crate::iterator::OnDiskIterator::construct(dir.path(), &meta_name, &data_name, 1).unwrap();

        let mut db = Database::open(dir.path()).unwrap();
        let snap = db.snapshot();
        let spec = TaskSpec {
            id: TaskId::from_raw(1),
            connection: "00".to_string(),
            request: "pop".to_string(),
        };
        let (entries, position, total) = snap
            .read_iterator(&spec, &IteratorId::new(meta_name.id()), 1)
            .unwrap();
        assert_eq!(entries, vec!["a"]);
        assert_eq!(position, 1);
        assert_eq!(total, 1);
    }
}
