//! # Database Snapshots
//!
//! A [`DatabaseSnapshot`] is an immutable view of the published datasets,
//! iterators and config at a moment in time, plus a handle back to the
//! coordinator for lock requests. Executors see the world only through this
//! façade.
//!
//! ## Sharing
//!
//! One snapshot is shared (via `Arc`) between the worker executing against
//! it and the coordinator, which records lock grants on it and uses it for
//! conflict checks. The dataset list and config are frozen at creation;
//! only the lock set and the worker link are interior-mutable, and both are
//! touched under short-lived mutexes.
//!
//! ## Lock Requests
//!
//! `lock_datasets` / `lock_iterator` send a lock-request message through the
//! installed [`WorkerLink`] and block until the coordinator answers. Denial
//! surfaces as a recoverable [`Error::LockDenied`]; executors that mutate in
//! place must call these before touching anything.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::dataset::{build_dataset, collect_files, Dataset};
use crate::error::{Error, Result};
use crate::frames::{Frame, FrameReader, Multipart, NetAction, NetLockResp};
use crate::iterator::OnDiskIterator;
use crate::response::QueryCounters;
use crate::results::ResultWriter;
use crate::types::{
    DatabaseLock, DatabaseName, DatasetId, DbChange, IndexType, IteratorId, Task, TaskSpec,
    WorkerId,
};

// =============================================================================
// Worker Link
// =============================================================================

/// The worker's channel pair back to the coordinator, installed on the
/// snapshot for the duration of one task.
///
/// The inbox is the worker's own dispatch receiver, shared behind a mutex:
/// while a task executes, the worker loop is not receiving, so the lock
/// reply is the only message that can arrive on it.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    worker_id: WorkerId,
    backend_tx: Sender<Multipart>,
    inbox: Arc<Mutex<Receiver<Multipart>>>,
}

impl WorkerLink {
    pub fn new(
        worker_id: WorkerId,
        backend_tx: Sender<Multipart>,
        inbox: Arc<Mutex<Receiver<Multipart>>>,
    ) -> Self {
        Self {
            worker_id,
            backend_tx,
            inbox,
        }
    }

    /// Sends one multi-name dataset lock request and blocks on the verdict.
    fn request_dataset_locks(&self, ids: &[DatasetId]) -> Result<NetLockResp> {
        let mut message: Multipart = vec![
            Frame::from(self.worker_id.as_str()),
            Frame::empty(),
            NetAction::DatasetLockReq.encode(),
        ];
        for id in ids {
            message.push(Frame::empty());
            message.push(Frame::from(id.as_str()));
        }
        // Empty-name terminator. Relies on dataset names being non-empty.
        message.push(Frame::empty());
        message.push(Frame::empty());

        self.roundtrip(message)
    }

    /// Sends a single iterator lock request and blocks on the verdict.
    fn request_iterator_lock(&self, id: &IteratorId) -> Result<NetLockResp> {
        let message: Multipart = vec![
            Frame::from(self.worker_id.as_str()),
            Frame::empty(),
            NetAction::IteratorLockReq.encode(),
            Frame::empty(),
            Frame::from(id.as_str()),
            Frame::empty(),
        ];
        self.roundtrip(message)
    }

    fn roundtrip(&self, message: Multipart) -> Result<NetLockResp> {
        self.backend_tx
            .send(message)
            .map_err(|_| Error::Protocol("backend channel closed".to_string()))?;

        let reply = {
            let inbox = self
                .inbox
                .lock()
                .map_err(|_| Error::Protocol("worker inbox poisoned".to_string()))?;
            inbox
                .recv()
                .map_err(|_| Error::Protocol("coordinator channel closed".to_string()))?
        };

        // Reply shape: [worker-id][""][LockOk|LockDenied]
        let mut reader = FrameReader::new(reply);
        let addressed_to = reader.next_str()?;
        if addressed_to != self.worker_id.as_str() {
            return Err(Error::Protocol(format!(
                "lock reply addressed to '{}' arrived at '{}'",
                addressed_to, self.worker_id
            )));
        }
        reader.expect_empty()?;
        NetLockResp::decode(&reader.next_frame()?)
    }
}

// =============================================================================
// DatabaseSnapshot
// =============================================================================

/// An immutable reference to the published database state at one moment.
///
/// Multiple snapshots coexist; the database retains every snapshot still
/// referenced by an active task and garbage-collects the rest after each
/// commit.
#[derive(Debug)]
pub struct DatabaseSnapshot {
    generation: u64,
    db_dir: PathBuf,
    datasets: Vec<Arc<Dataset>>,
    iterators: HashMap<IteratorId, DatabaseName>,
    config: DatabaseConfig,
    tasks: Vec<TaskSpec>,
    locks: Mutex<HashSet<DatabaseLock>>,
    link: Mutex<Option<WorkerLink>>,
}

impl DatabaseSnapshot {
    pub fn new(
        generation: u64,
        db_dir: PathBuf,
        datasets: Vec<Arc<Dataset>>,
        iterators: HashMap<IteratorId, DatabaseName>,
        config: DatabaseConfig,
        tasks: Vec<TaskSpec>,
    ) -> Self {
        Self {
            generation,
            db_dir,
            datasets,
            iterators,
            config,
            tasks,
            locks: Mutex::new(HashSet::new()),
            link: Mutex::new(None),
        }
    }

    /// Generation stamp; newer snapshots have strictly larger values.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The database's on-disk directory.
    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Every published dataset in this view.
    pub fn get_datasets(&self) -> &[Arc<Dataset>] {
        &self.datasets
    }

    /// Looks up one dataset by id.
    pub fn find_dataset(&self, id: &DatasetId) -> Option<&Arc<Dataset>> {
        self.datasets.iter().find(|ds| ds.id() == id)
    }

    /// Tasks that were active when this snapshot was taken.
    pub fn get_tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    /// Config values frozen into this view.
    pub fn get_config(&self) -> &DatabaseConfig {
        &self.config
    }

    // =========================================================================
    // Name Allocation
    // =========================================================================

    /// Allocates a fresh on-disk name under `namespace`, avoiding the rare
    /// collision with an existing file.
    pub fn allocate_name(&self, namespace: &str) -> DatabaseName {
        loop {
            let name = DatabaseName::allocate(namespace);
            if !name.full_path(&self.db_dir).exists() {
                return name;
            }
        }
    }

    /// Derives the sibling of `name` in another namespace.
    pub fn derive_name(&self, name: &DatabaseName, namespace: &str) -> DatabaseName {
        name.derive(namespace)
    }

    // =========================================================================
    // Query Execution
    // =========================================================================

    /// Runs a query over the datasets selected by the taint and dataset
    /// filters, streaming matches to the writer.
    ///
    /// An explicit dataset filter naming an unknown id is a recoverable
    /// error; an empty filter means "all". A taint filter keeps only
    /// datasets carrying every listed taint.
    pub fn execute(
        &self,
        query: &crate::command::Query,
        taints: &[String],
        datasets: &[DatasetId],
        task: &TaskSpec,
        writer: &mut dyn ResultWriter,
    ) -> Result<QueryCounters> {
        debug!(task = %task.id, query = query.as_str(), "executing query");

        let mut selected: Vec<&Arc<Dataset>> = Vec::new();
        if datasets.is_empty() {
            selected.extend(self.datasets.iter());
        } else {
            for id in datasets {
                let ds = self
                    .find_dataset(id)
                    .ok_or_else(|| Error::UnknownDataset(id.as_str().to_string()))?;
                selected.push(ds);
            }
        }
        selected.retain(|ds| taints.iter().all(|t| ds.has_taint(t)));

        let mut counters = QueryCounters::default();
        for ds in selected {
            ds.scan(query.as_str().as_bytes(), writer, &mut counters)?;
        }
        Ok(counters)
    }

    // =========================================================================
    // Iterators
    // =========================================================================

    /// Pops up to `count` entries off the named iterator.
    ///
    /// Returns the entries, the new position and the fixed total count. The
    /// caller holds the iterator lock, which serializes concurrent pops,
    /// but only pop-by-pop: the lock dies with the popping task, so a
    /// sequence of pops is not a critical section.
    pub fn read_iterator(
        &self,
        task: &TaskSpec,
        iterator_id: &IteratorId,
        count: u64,
    ) -> Result<(Vec<String>, u64, u64)> {
        debug!(task = %task.id, iterator = %iterator_id, count, "iterator pop");

        let meta_name = self
            .iterators
            .get(iterator_id)
            .ok_or_else(|| Error::UnknownIterator(iterator_id.as_str().to_string()))?;
        let mut iterator = OnDiskIterator::load(&self.db_dir, meta_name)?;
        let entries = iterator.pop(count)?;
        Ok((entries, iterator.position(), iterator.total_files()))
    }

    // =========================================================================
    // Indexing
    // =========================================================================

    /// Indexes the given paths recursively, skipping files already covered
    /// by any dataset in this view, and stages the new dataset.
    pub fn recursive_index_paths(
        &self,
        task: &mut Task,
        index_types: &[IndexType],
        taints: &[String],
        paths: &[String],
    ) -> Result<()> {
        let mut files = collect_files(&paths.iter().map(PathBuf::from).collect::<Vec<_>>())?;
        files.retain(|f| !self.datasets.iter().any(|ds| ds.contains_file(f)));
        self.stage_new_dataset(task, files, index_types, taints)
    }

    /// Indexes the given paths recursively without the uniqueness check.
    pub fn force_recursive_index_paths(
        &self,
        task: &mut Task,
        index_types: &[IndexType],
        taints: &[String],
        paths: &[String],
    ) -> Result<()> {
        let files = collect_files(&paths.iter().map(PathBuf::from).collect::<Vec<_>>())?;
        self.stage_new_dataset(task, files, index_types, taints)
    }

    fn stage_new_dataset(
        &self,
        task: &mut Task,
        files: Vec<PathBuf>,
        index_types: &[IndexType],
        taints: &[String],
    ) -> Result<()> {
        if files.is_empty() {
            // Nothing new to index; staging an empty dataset would only
            // clutter topology.
            return Ok(());
        }
        let dataset = build_dataset(files, index_types, taints)?;
        task.change(DbChange::NewDataset(dataset));
        Ok(())
    }

    /// Rebuilds a dataset with the given index types and stages the swap.
    ///
    /// The caller must already hold the dataset's lock.
    pub fn reindex_dataset(
        &self,
        task: &mut Task,
        index_types: &[IndexType],
        dataset_id: &DatasetId,
    ) -> Result<()> {
        let old = self
            .find_dataset(dataset_id)
            .ok_or_else(|| Error::UnknownDataset(dataset_id.as_str().to_string()))?;

        let taints: Vec<String> = old.taints().iter().cloned().collect();
        let rebuilt = build_dataset(old.files().to_vec(), index_types, &taints)?;
        task.change(DbChange::NewDataset(rebuilt));
        task.change(DbChange::Drop(dataset_id.clone()));
        Ok(())
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Candidates for `compact smart`: datasets below the mean index size.
    ///
    /// Merging many small datasets buys the most query-time fan-in for the
    /// least I/O; large datasets are left alone. Fewer than two candidates
    /// means nothing to merge.
    pub fn compact_smart_candidates(&self) -> Vec<DatasetId> {
        if self.datasets.len() < 2 {
            return Vec::new();
        }
        let total: u64 = self.datasets.iter().map(|ds| ds.total_index_size()).sum();
        let mean = total / self.datasets.len() as u64;
        let mut candidates: Vec<DatasetId> = self
            .datasets
            .iter()
            .filter(|ds| ds.total_index_size() <= mean)
            .map(|ds| ds.id().clone())
            .collect();
        if candidates.len() < 2 {
            return Vec::new();
        }
        candidates.truncate(self.merge_cap());
        candidates
    }

    /// Candidates for `compact all`: every dataset, up to the merge cap.
    pub fn compact_full_candidates(&self) -> Vec<DatasetId> {
        if self.datasets.len() < 2 {
            return Vec::new();
        }
        let mut candidates: Vec<DatasetId> =
            self.datasets.iter().map(|ds| ds.id().clone()).collect();
        candidates.truncate(self.merge_cap());
        candidates
    }

    fn merge_cap(&self) -> usize {
        let key = crate::config::ConfigKey::parse("merge_max_datasets")
            .expect("merge_max_datasets is registered");
        self.config.get(key) as usize
    }

    /// Merges the datasets this task has locked into one and stages the
    /// swap. With fewer than two locked datasets this is a no-op.
    pub fn compact_locked_datasets(&self, task: &mut Task) -> Result<()> {
        let locked: Vec<&Arc<Dataset>> = {
            let locks = self.locks.lock().expect("lock set poisoned");
            self.datasets
                .iter()
                .filter(|ds| locks.contains(&DatabaseLock::Dataset(ds.id().clone())))
                .collect()
        };
        if locked.len() < 2 {
            return Ok(());
        }

        let mut files: Vec<PathBuf> = Vec::new();
        let mut taints: HashSet<String> = HashSet::new();
        let mut index_types: Vec<IndexType> = Vec::new();
        for ds in &locked {
            for file in ds.files() {
                if !files.contains(file) {
                    files.push(file.clone());
                }
            }
            taints.extend(ds.taints().iter().cloned());
            for ix in ds.indexes() {
                if !index_types.contains(&ix.index_type) {
                    index_types.push(ix.index_type);
                }
            }
        }

        let taints: Vec<String> = taints.into_iter().collect();
        let merged = build_dataset(files, &index_types, &taints)?;
        task.change(DbChange::NewDataset(merged));
        for ds in locked {
            task.change(DbChange::Drop(ds.id().clone()));
        }
        Ok(())
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Installs the worker's coordinator link for the duration of a task.
    pub fn set_worker_link(&self, link: WorkerLink) {
        *self.link.lock().expect("link slot poisoned") = Some(link);
    }

    /// Requests an atomic set of dataset locks from the coordinator,
    /// blocking until the verdict.
    pub fn lock_datasets(&self, ids: &[DatasetId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let link = self.worker_link()?;
        match link.request_dataset_locks(ids)? {
            NetLockResp::LockOk => Ok(()),
            NetLockResp::LockDenied => {
                let names: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
                Err(Error::LockDenied(names.join(", ")))
            }
        }
    }

    /// Requests a single iterator lock from the coordinator.
    pub fn lock_iterator(&self, id: &IteratorId) -> Result<()> {
        let link = self.worker_link()?;
        match link.request_iterator_lock(id)? {
            NetLockResp::LockOk => Ok(()),
            NetLockResp::LockDenied => Err(Error::LockDenied(id.as_str().to_string())),
        }
    }

    fn worker_link(&self) -> Result<WorkerLink> {
        self.link
            .lock()
            .expect("link slot poisoned")
            .clone()
            .ok_or_else(|| Error::Protocol("no coordinator link installed".to_string()))
    }

    /// Records a dataset lock grant. Coordinator-side only.
    pub fn mark_dataset_locked(&self, id: DatasetId) {
        self.locks
            .lock()
            .expect("lock set poisoned")
            .insert(DatabaseLock::Dataset(id));
    }

    /// Records an iterator lock grant. Coordinator-side only.
    pub fn mark_iterator_locked(&self, id: IteratorId) {
        self.locks
            .lock()
            .expect("lock set poisoned")
            .insert(DatabaseLock::Iterator(id));
    }

    /// Whether this snapshot's task holds the dataset lock.
    pub fn is_dataset_locked(&self, id: &DatasetId) -> bool {
        self.locks
            .lock()
            .expect("lock set poisoned")
            .contains(&DatabaseLock::Dataset(id.clone()))
    }

    /// Whether this snapshot's task holds the iterator lock.
    pub fn is_iterator_locked(&self, id: &IteratorId) -> bool {
        self.locks
            .lock()
            .expect("lock set poisoned")
            .contains(&DatabaseLock::Iterator(id.clone()))
    }
}

// =============================================================================
// Tests
// =============================================================================
