//! # GrimDB - Content Indexing Service Core
//!
//! GrimDB is the command-dispatch and worker-coordination core of a content
//! indexing service. Clients submit query and administrative commands
//! (index, select, iterate results, reindex, compact, taint, drop, config)
//! to a single coordinator, which routes each request to one of a fixed
//! pool of worker executors, each operating against an immutable snapshot
//! of database state.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Async API Layer                           │
//! │                  (GrimDb::request / reply)                      │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ frontend frames
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Coordinator                              │
//! │             (single thread, owns the database)                  │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  LRU idle   │  │    lock     │  │  task commit +          │  │
//! │  │  worker     │  │ arbitration │  │  snapshot GC            │  │
//! │  │  queue      │  │             │  │                         │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ backend frames
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Worker Threads (N)                         │
//! │        parse → plan locks → execute against snapshot            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! These invariants are enforced throughout the codebase and must never be
//! violated:
//!
//! 1. **Snapshot isolation**: a committed change is visible only in
//!    snapshots created after commit
//! 2. **Atomic commit**: a task's staged changes apply all-or-nothing, in
//!    staging order
//! 3. **Exclusive locks**: at most one active task holds a lock on a given
//!    dataset or iterator id
//! 4. **Admission control**: the frontend is polled only while at least one
//!    worker is idle
//! 5. **Framing discipline**: a non-empty frame where an empty separator is
//!    expected is fatal to the observer; the only fatal error class
//!
//! ## Module Organization
//!
//! - [`error`]: the single error enum and its recoverable/protocol split
//! - [`types`]: identifiers, tasks, staged changes, locks
//! - [`frames`]: multipart message model and action codecs
//! - [`command`]: request grammar and parser
//! - [`response`]: wire responses (JSON)
//! - [`config`]: typed config key registry
//! - [`dataset`]: dataset metadata, indexing walk, content scan
//! - [`results`]: memory- and file-backed result writers
//! - [`iterator`]: durable `{data-file, meta-file}` cursors
//! - [`snapshot`]: the immutable view executors run against
//! - [`database`]: the coordinator-owned registry and commit logic
//! - [`executors`]: one executor per command, lock planner, safe dispatch
//! - [`worker`]: per-worker state machine threads
//! - [`coordinator`]: the event loop tying it all together
//! - [`api`]: the public async handle

/// Error types for all grimdb operations.
pub mod error;

/// Domain types: identifiers, tasks, staged changes, locks.
pub mod types;

/// Multi-frame message model shared by both wire directions.
pub mod frames;

/// Request string parsing into the `Command` sum type.
pub mod command;

/// Wire response values and their JSON form.
pub mod response;

/// Runtime-tunable configuration keys with range validation.
pub mod config;

/// Dataset metadata, the indexing walk and the content scan.
pub mod dataset;

/// Result writer capability objects.
pub mod results;

/// On-disk iterators (durable query cursors).
pub mod iterator;

/// The immutable database view handed to executors, plus the worker-side
/// lock request handle.
pub mod snapshot;

/// The coordinator-owned registry: datasets, iterators, config, tasks,
/// retained snapshots.
pub mod database;

/// Command executors, the lock planner and safe dispatch.
pub mod executors;

/// Worker threads.
pub mod worker;

/// The coordinator event loop.
pub mod coordinator;

/// The public async API.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::GrimDb;
pub use command::{parse_command, Command, Query};
pub use coordinator::Coordinator;
pub use database::Database;
pub use error::{Error, Result};
pub use response::{QueryCounters, Response};
pub use snapshot::DatabaseSnapshot;

// Re-export commonly used domain types at the crate root.
pub use types::{
    CompactMode, DatabaseLock, DatabaseName, DatasetId, DbChange, IndexType, IteratorId,
    TaintMode, Task, TaskId, TaskSpec, WorkerId,
};
