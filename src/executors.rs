//! # Command Executors
//!
//! One executor arm per [`Command`] variant, the lock planner that declares
//! what a command will mutate, and the safe-dispatch wrapper that keeps
//! workers alive across recoverable failures.
//!
//! ## Dispatch Contract
//!
//! ```text
//! request string ──parse──▶ Command ──plan locks──▶ acquire via snapshot
//!                                      │
//!                                      ▼
//!                            executor arm ──▶ Response + staged DBChanges
//! ```
//!
//! Executors stage changes only after their fallible work has succeeded, so
//! a failed command never leaves half a mutation on the task.
//!
//! `Command` is matched exhaustively in both [`dispatch_command`] and
//! [`plan_locks`]: a new variant will not compile until both know about it.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

use crate::command::{parse_command, Command};
use crate::error::{Error, Result};
use crate::iterator::{OnDiskIterator, ITERMETA_NAMESPACE};
use crate::response::{DatasetEntry, IndexEntry, Response};
use crate::results::{FileResultWriter, InMemoryResultWriter, ResultWriter};
use crate::snapshot::DatabaseSnapshot;
use crate::types::{CompactMode, DatabaseLock, IteratorId, TaintMode, Task};

// =============================================================================
// Lock Planner
// =============================================================================

/// The locks a command will need before execution.
///
/// Locking is pessimistic only where the identity being mutated already
/// exists in the snapshot: a `select into iterator` creates its iterator and
/// `index` creates its dataset, so neither has anything to lock yet.
pub fn plan_locks(command: &Command, snap: &DatabaseSnapshot) -> Vec<DatabaseLock> {
    match command {
        Command::IteratorPop { iterator_id, .. } => {
            vec![DatabaseLock::Iterator(iterator_id.clone())]
        }
        Command::Reindex { dataset_id, .. } => {
            vec![DatabaseLock::Dataset(dataset_id.clone())]
        }
        Command::Taint { dataset, .. } => {
            vec![DatabaseLock::Dataset(dataset.clone())]
        }
        Command::Compact { mode } => {
            let candidates = match mode {
                CompactMode::Smart => snap.compact_smart_candidates(),
                CompactMode::Full => snap.compact_full_candidates(),
            };
            candidates.into_iter().map(DatabaseLock::Dataset).collect()
        }
        // Read-only with respect to the snapshot, or creating identities
        // that don't exist yet.
        Command::Select { .. }
        | Command::Index { .. }
        | Command::IndexFrom { .. }
        | Command::Status
        | Command::Topology
        | Command::Ping
        | Command::ConfigGet { .. }
        | Command::ConfigSet { .. }
        | Command::DatasetDrop { .. } => Vec::new(),
    }
}

/// Acquires the planned locks through the snapshot, dataset locks as one
/// atomic multi-name request.
fn acquire_locks(locks: Vec<DatabaseLock>, snap: &DatabaseSnapshot) -> Result<()> {
    let mut datasets = Vec::new();
    let mut iterators = Vec::new();
    for lock in locks {
        match lock {
            DatabaseLock::Dataset(id) => datasets.push(id),
            DatabaseLock::Iterator(id) => iterators.push(id),
        }
    }
    snap.lock_datasets(&datasets)?;
    for id in &iterators {
        snap.lock_iterator(id)?;
    }
    Ok(())
}

// =============================================================================
// Executors
// =============================================================================

/// Acquires the command's declared locks, then runs its executor arm.
pub fn dispatch_command(
    command: &Command,
    task: &mut Task,
    snap: &DatabaseSnapshot,
) -> Result<Response> {
    acquire_locks(plan_locks(command, snap), snap)?;

    match command {
        Command::Select {
            query,
            taints,
            datasets,
            iterator_requested,
        } => {
            if *iterator_requested {
                let data_name = snap.allocate_name(crate::iterator::ITERATOR_NAMESPACE);
                let mut writer = FileResultWriter::create(&data_name.full_path(snap.db_dir()))?;
                let counters = snap.execute(query, taints, datasets, task.spec(), &mut writer)?;
                writer.finalize()?;

                let meta_name = snap.derive_name(&data_name, ITERMETA_NAMESPACE);
                OnDiskIterator::construct(
                    snap.db_dir(),
                    &meta_name,
                    &data_name,
                    writer.file_count(),
                )?;
                task.change(crate::types::DbChange::NewIterator(meta_name.clone()));
                Ok(Response::select_iterator(
                    IteratorId::new(meta_name.id()),
                    writer.file_count(),
                    counters,
                ))
            } else {
                let mut writer = InMemoryResultWriter::new();
                let counters = snap.execute(query, taints, datasets, task.spec(), &mut writer)?;
                Ok(Response::select(writer.into_files(), counters))
            }
        }

        Command::IteratorPop { iterator_id, count } => {
            let (files, position, total) = snap.read_iterator(task.spec(), iterator_id, *count)?;
            Ok(Response::iterator_pop(files, position, total))
        }

        Command::Index {
            paths,
            index_types,
            taints,
            ensure_unique,
        } => {
            if *ensure_unique {
                snap.recursive_index_paths(task, index_types, taints, paths)?;
            } else {
                snap.force_recursive_index_paths(task, index_types, taints, paths)?;
            }
            Ok(Response::ok())
        }

        Command::IndexFrom {
            path_list_file,
            index_types,
            taints,
            ensure_unique,
        } => {
            let listing = std::fs::read_to_string(path_list_file)?;
            let paths: Vec<String> = listing
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            if *ensure_unique {
                snap.recursive_index_paths(task, index_types, taints, &paths)?;
            } else {
                snap.force_recursive_index_paths(task, index_types, taints, &paths)?;
            }
            Ok(Response::ok())
        }

        Command::Reindex {
            dataset_id,
            index_types,
        } => {
            snap.reindex_dataset(task, index_types, dataset_id)?;
            Ok(Response::ok())
        }

        Command::Compact { .. } => {
            snap.compact_locked_datasets(task)?;
            Ok(Response::ok())
        }

        Command::Status => Ok(Response::status(snap.get_tasks().to_vec())),

        Command::Topology => {
            let datasets = snap
                .get_datasets()
                .iter()
                .map(|ds| DatasetEntry {
                    id: ds.id().clone(),
                    size: ds.total_index_size(),
                    file_count: ds.file_count(),
                    taints: ds.taints().iter().cloned().collect(),
                    indexes: ds
                        .indexes()
                        .iter()
                        .map(|ix| IndexEntry {
                            index_type: ix.index_type,
                            size: ix.size,
                        })
                        .collect(),
                })
                .collect();
            Ok(Response::topology(datasets))
        }

        Command::Ping => Ok(Response::ping(task.spec().hex_conn_id())),

        Command::ConfigGet { keys } => {
            let config = snap.get_config();
            if keys.is_empty() {
                return Ok(Response::config(config.get_all()));
            }
            // Unknown keys are silently omitted.
            let values = keys
                .iter()
                .filter_map(|name| {
                    crate::config::ConfigKey::parse(name)
                        .map(|key| (name.clone(), config.get(key)))
                })
                .collect();
            Ok(Response::config(values))
        }

        Command::ConfigSet { key, value } => {
            let parsed = crate::config::ConfigKey::parse(key).ok_or(Error::InvalidConfigKey)?;
            if !snap.get_config().can_set(parsed, *value) {
                return Err(Error::ConfigValueOutOfRange);
            }
            task.change(crate::types::DbChange::ConfigChange {
                key: key.clone(),
                value: *value,
            });
            Ok(Response::ok())
        }

        Command::Taint {
            dataset,
            taint,
            mode,
        } => {
            let ds = snap
                .find_dataset(dataset)
                .ok_or_else(|| Error::UnknownDataset(dataset.as_str().to_string()))?;
            let has_taint = ds.has_taint(taint);
            let should_have = *mode == TaintMode::Add;
            if has_taint != should_have {
                task.change(crate::types::DbChange::ToggleTaint {
                    dataset: dataset.clone(),
                    taint: taint.clone(),
                });
            }
            Ok(Response::ok())
        }

        Command::DatasetDrop { dataset_id } => {
            task.change(crate::types::DbChange::Drop(dataset_id.clone()));
            Ok(Response::ok())
        }
    }
}

// =============================================================================
// Safe Dispatch
// =============================================================================

/// Parses and dispatches a request, converting every recoverable failure,
/// including executor panics, into an error [`Response`].
///
/// Only protocol-class errors propagate: they mean the messaging layer
/// itself is broken and the worker must terminate rather than answer.
pub fn dispatch_command_safe(
    request: &str,
    task: &mut Task,
    snap: &DatabaseSnapshot,
) -> Result<Response> {
    let task_id = task.id();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let command = parse_command(request)?;
        dispatch_command(&command, task, snap)
    }));

    match outcome {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) if err.is_protocol() => Err(err),
        Ok(Err(err)) => {
            error!(task = %task_id, error = %err, "task failed");
            Ok(Response::error(err.to_string()))
        }
        Err(_panic) => {
            error!(task = %task_id, "task panicked during execution");
            Ok(Response::error("task execution panicked"))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
