//! # Domain Types
//!
//! Core types for the dispatch and coordination layer: identifiers, tasks,
//! staged database changes, and locks.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Identifiers are wrapped in single-field structs instead of passed around
//! as bare strings or integers. A [`DatasetId`] cannot be handed to a
//! function expecting an [`IteratorId`], and a [`TaskId`] cannot be confused
//! with a worker index. The representation stays private so it can change
//! without touching call sites.
//!
//! ## Invariants Encoded Here
//!
//! - [`TaskId`]: monotonic, assigned by the database, never reused
//! - [`Task`]: staged changes are append-only during execution
//! - [`DatabaseName`]: namespace-qualified on-disk names; a derived name
//!   shares the id of its source and differs only in namespace

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::dataset::Dataset;

// =============================================================================
// Identifiers
// =============================================================================

/// Monotonic identifier of one client request in flight.
///
/// Assigned by [`crate::database::Database::allocate_task`] and tracked from
/// allocation to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a TaskId from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next task id.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one worker thread on the backend.
///
/// Workers announce themselves under this identity and every backend message
/// is prefixed with it, so the coordinator can route replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Creates a new worker identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Stable identifier of a published dataset (e.g. `set_1f2e3d4c`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DatasetId(String);

impl DatasetId {
    /// Creates a new dataset id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a durable result iterator.
///
/// The id doubles as the shared name component of the iterator's on-disk
/// `{data-file, meta-file}` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IteratorId(String);

impl IteratorId {
    /// Creates a new iterator id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IteratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IteratorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Index, Taint and Compact Modes
// =============================================================================

/// Kind of secondary index built over a dataset.
///
/// The set is closed: adding a kind means touching the parser, the builder
/// and the topology response, and the compiler will point at all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    /// Trigrams over raw bytes.
    Gram3,
    /// 4-grams over ASCII text.
    Text4,
    /// Hashed 4-grams.
    Hash4,
    /// 8-byte wide-character grams (UTF-16 text).
    Wide8,
}

impl IndexType {
    /// Parses an index type name as it appears in requests.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "gram3" => Some(IndexType::Gram3),
            "text4" => Some(IndexType::Text4),
            "hash4" => Some(IndexType::Hash4),
            "wide8" => Some(IndexType::Wide8),
            _ => None,
        }
    }

    /// Returns the wire name of this index type.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Gram3 => "gram3",
            IndexType::Text4 => "text4",
            IndexType::Hash4 => "hash4",
            IndexType::Wide8 => "wide8",
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a taint command adds or removes the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintMode {
    Add,
    Remove,
}

/// Compaction candidate selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactMode {
    /// Candidates picked by the storage layer's size heuristic.
    Smart,
    /// Every eligible dataset.
    Full,
}

// =============================================================================
// On-Disk Names
// =============================================================================

/// A namespace-qualified on-disk file name inside the database directory.
///
/// Iterators persist as a pair of these: the data file under the `iterator`
/// namespace and its metadata sibling under `itermeta`, sharing one id. The
/// sibling is produced with [`DatabaseName::derive`], never by re-allocating.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseName {
    namespace: String,
    id: String,
}

impl DatabaseName {
    /// Creates a name from its parts.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    /// Allocates a fresh name under `namespace` with a random id.
    ///
    /// Collisions are vanishingly unlikely (64 random bits) but callers that
    /// create files should still use `create_new` semantics.
    pub fn allocate(namespace: &str) -> Self {
        let id: u64 = rand::random();
        Self {
            namespace: namespace.to_string(),
            id: format!("{:016x}", id),
        }
    }

    /// Derives the sibling name in another namespace, keeping the id.
    pub fn derive(&self, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            id: self.id.clone(),
        }
    }

    /// The id component shared by derived siblings.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The namespace component.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The bare file name, `<namespace>.<id>.grim`.
    pub fn filename(&self) -> String {
        format!("{}.{}.grim", self.namespace, self.id)
    }

    /// The full path inside the given database directory.
    pub fn full_path(&self, db_dir: &Path) -> PathBuf {
        db_dir.join(self.filename())
    }

    /// Parses a name back from its bare file name form.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let mut parts = filename.splitn(3, '.');
        let namespace = parts.next()?;
        let id = parts.next()?;
        if parts.next()? != "grim" || namespace.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(namespace, id))
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.filename())
    }
}

// =============================================================================
// Locks
// =============================================================================

/// A coordinator-granted right to mutate a dataset or iterator.
///
/// A lock is a declaration of intent, not a mutex over memory: conflicts are
/// resolved by the coordinator refusing overlapping grants, and a grant is
/// held until the owning task commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatabaseLock {
    Dataset(DatasetId),
    Iterator(IteratorId),
}

impl fmt::Display for DatabaseLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseLock::Dataset(id) => write!(f, "dataset:{}", id),
            DatabaseLock::Iterator(id) => write!(f, "iterator:{}", id),
        }
    }
}

// =============================================================================
// Staged Changes
// =============================================================================

/// A staged mutation recorded on a task during execution.
///
/// Changes are appended in execution order and applied atomically, in that
/// order, when the coordinator commits the task. A change is visible only in
/// snapshots created after commit.
#[derive(Debug, Clone)]
pub enum DbChange {
    /// Publish a freshly built dataset (index, reindex, compact).
    NewDataset(Dataset),
    /// Register an iterator by its metadata file name.
    NewIterator(DatabaseName),
    /// Set a config key to a new value.
    ConfigChange { key: String, value: u64 },
    /// Flip a taint label's membership on a dataset.
    ToggleTaint { dataset: DatasetId, taint: String },
    /// Remove a dataset from the registry.
    Drop(DatasetId),
}

// =============================================================================
// Tasks
// =============================================================================

/// Immutable description of a task, shared with status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSpec {
    /// Monotonic task id.
    pub id: TaskId,
    /// Hex connection id of the requesting client.
    pub connection: String,
    /// The raw request string.
    pub request: String,
}

impl TaskSpec {
    /// The hex connection id from the dispatching client address.
    pub fn hex_conn_id(&self) -> &str {
        &self.connection
    }
}

/// One client request in flight.
///
/// Owned by the coordinator between allocation and dispatch, by exactly one
/// worker during execution, and by the coordinator again at commit. The
/// staged change list is append-only while the worker holds it.
#[derive(Debug)]
pub struct Task {
    spec: TaskSpec,
    changes: Vec<DbChange>,
}

impl Task {
    /// Creates a task for a request from the given client connection.
    pub fn new(id: TaskId, request: impl Into<String>, connection: impl Into<String>) -> Self {
        Self {
            spec: TaskSpec {
                id,
                connection: connection.into(),
                request: request.into(),
            },
            changes: Vec::new(),
        }
    }

    /// The task's immutable spec.
    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// The task id.
    pub fn id(&self) -> TaskId {
        self.spec.id
    }

    /// Stages a change to be applied at commit.
    pub fn change(&mut self, change: DbChange) {
        self.changes.push(change);
    }

    /// The staged changes, in execution order.
    pub fn changes(&self) -> &[DbChange] {
        &self.changes
    }

    /// Consumes the task, yielding its staged changes in order.
    pub fn into_changes(self) -> Vec<DbChange> {
        self.changes
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_monotonic() {
        let id = TaskId::from_raw(41);
        assert_eq!(id.next().as_raw(), 42);
        assert!(id < id.next());
    }

    #[test]
    fn test_index_type_parse_roundtrip() {
        for name in ["gram3", "text4", "hash4", "wide8"] {
            let ty = IndexType::parse(name).unwrap();
            assert_eq!(ty.as_str(), name);
        }
        assert!(IndexType::parse("gram4").is_none());
        assert!(IndexType::parse("").is_none());
    }

    #[test]
    fn test_database_name_derive_shares_id() {
        let data = DatabaseName::allocate("iterator");
        let meta = data.derive("itermeta");
        assert_eq!(data.id(), meta.id());
        assert_ne!(data.filename(), meta.filename());
        assert!(meta.filename().starts_with("itermeta."));
    }

    #[test]
    fn test_database_name_filename_roundtrip() {
        let name = DatabaseName::new("itermeta", "00ff00ff00ff00ff");
        let parsed = DatabaseName::from_filename(&name.filename()).unwrap();
        assert_eq!(parsed, name);

        assert!(DatabaseName::from_filename("no-dots").is_none());
        assert!(DatabaseName::from_filename("a.b.wrong").is_none());
        assert!(DatabaseName::from_filename(".x.grim").is_none());
    }

    #[test]
    fn test_task_staging_preserves_order() {
        let mut task = Task::new(TaskId::from_raw(1), "status;", "c0ffee");
        task.change(DbChange::Drop(DatasetId::new("set_a")));
        task.change(DbChange::ToggleTaint {
            dataset: DatasetId::new("set_b"),
            taint: "evil".to_string(),
        });

        let changes = task.into_changes();
        assert_eq!(changes.len(), 2);
        assert!(matches!(&changes[0], DbChange::Drop(id) if id.as_str() == "set_a"));
        assert!(matches!(&changes[1], DbChange::ToggleTaint { taint, .. } if taint == "evil"));
    }

    #[test]
    fn test_lock_display() {
        let lock = DatabaseLock::Dataset(DatasetId::new("set_1"));
        assert_eq!(lock.to_string(), "dataset:set_1");
        let lock = DatabaseLock::Iterator(IteratorId::new("abc"));
        assert_eq!(lock.to_string(), "iterator:abc");
    }
}
