//! # Worker Threads
//!
//! Each worker is a single thread running a small state machine:
//!
//! ```text
//!          ┌─────────────────────────────────────────────┐
//!          ▼                                             │
//!  announce Ready ──▶ Idle (blocked on inbox)            │
//!                        │ [client-addr][""][request]    │
//!                        ▼                               │
//!                  safe dispatch ──▶ send Response ──────┘
//!                        │
//!                        ▼ (mid-execution, via snapshot)
//!                  lock request ⇄ coordinator
//! ```
//!
//! A worker never processes two tasks concurrently: the coordinator only
//! dispatches to workers it popped off the idle queue. While a task
//! executes, the worker loop is not receiving, so the shared inbox can be
//! borrowed by the snapshot's [`WorkerLink`] for the lock-reply roundtrip.
//!
//! A framing violation on the inbox terminates the worker; its own
//! violations are its own problem, independent of the coordinator's.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info};

use crate::error::Result;
use crate::executors::dispatch_command_safe;
use crate::frames::{Frame, FrameReader, Multipart, NetAction};
use crate::snapshot::{DatabaseSnapshot, WorkerLink};
use crate::types::{Task, WorkerId};

// =============================================================================
// Worker Cell
// =============================================================================

/// The coordinator-to-worker handoff slot.
///
/// The coordinator writes the task and snapshot *before* sending the
/// dispatch frames; the worker reads them *after* receiving the frames. The
/// message round-trip provides the happens-before edge; the mutexes make it
/// sound in Rust.
#[derive(Debug, Default)]
pub struct WorkerCell {
    task: Mutex<Option<Task>>,
    snapshot: Mutex<Option<Arc<DatabaseSnapshot>>>,
}

impl WorkerCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator side: assigns a task and a fresh snapshot.
    pub fn assign(&self, task: Task, snapshot: Arc<DatabaseSnapshot>) {
        *self.task.lock().expect("task slot poisoned") = Some(task);
        *self.snapshot.lock().expect("snapshot slot poisoned") = Some(snapshot);
    }

    /// Worker side: takes the assigned task for execution.
    pub fn take_task(&self) -> Option<Task> {
        self.task.lock().expect("task slot poisoned").take()
    }

    /// Worker side: hands the executed task (with staged changes) back for
    /// commit.
    pub fn put_task(&self, task: Task) {
        *self.task.lock().expect("task slot poisoned") = Some(task);
    }

    /// Takes the snapshot assigned for the current task.
    pub fn take_snapshot(&self) -> Option<Arc<DatabaseSnapshot>> {
        self.snapshot.lock().expect("snapshot slot poisoned").take()
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Spawns one worker thread.
///
/// * `backend_tx`: shared channel into the coordinator's backend
/// * `inbox_rx`: this worker's private dispatch/lock-reply channel
/// * `cell`: the handoff slot shared with the coordinator
pub fn spawn_worker(
    worker_id: WorkerId,
    backend_tx: Sender<Multipart>,
    inbox_rx: Receiver<Multipart>,
    cell: Arc<WorkerCell>,
) -> JoinHandle<()> {
    let thread_name = format!("grimdb-worker-{}", worker_id);
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let inbox = Arc::new(Mutex::new(inbox_rx));
            if let Err(err) = run_worker(&worker_id, &backend_tx, &inbox, &cell) {
                error!(worker = %worker_id, error = %err, "worker terminated");
            }
        })
        .expect("failed to spawn worker thread")
}

/// The worker's main loop. Returns `Ok(())` on clean shutdown (channels
/// closed) and `Err` on a protocol violation.
fn run_worker(
    worker_id: &WorkerId,
    backend_tx: &Sender<Multipart>,
    inbox: &Arc<Mutex<Receiver<Multipart>>>,
    cell: &WorkerCell,
) -> Result<()> {
    // Tell the coordinator we're ready for work.
    let ready: Multipart = vec![
        Frame::from(worker_id.as_str()),
        Frame::empty(),
        NetAction::Ready.encode(),
    ];
    if backend_tx.send(ready).is_err() {
        return Ok(());
    }

    loop {
        let message = {
            let rx = inbox.lock().expect("worker inbox poisoned");
            match rx.recv() {
                Ok(message) => message,
                Err(_) => return Ok(()),
            }
        };

        // Dispatch shape: [client-addr][""][request]
        let mut reader = FrameReader::new(message);
        let client_addr = reader.next_str()?;
        reader.expect_empty()?;
        let request = reader.next_str()?;

        let (mut task, snap) = match (cell.take_task(), cell.take_snapshot()) {
            (Some(task), Some(snap)) => (task, snap),
            _ => {
                return Err(crate::error::Error::Protocol(
                    "dispatched without a task assignment".to_string(),
                ))
            }
        };

        info!(task = %task.id(), worker = %worker_id, request = %request, "task started");

        snap.set_worker_link(WorkerLink::new(
            worker_id.clone(),
            backend_tx.clone(),
            Arc::clone(inbox),
        ));

        let response = dispatch_command_safe(&request, &mut task, &snap)?;
        let reply = response.to_wire();

        // Hand the task (with its staged changes) back before announcing the
        // response, so the coordinator finds it there when committing.
        cell.put_task(task);

        let message: Multipart = vec![
            Frame::from(worker_id.as_str()),
            Frame::empty(),
            NetAction::Response.encode(),
            Frame::empty(),
            Frame::from(client_addr),
            Frame::empty(),
            Frame::from(reply),
        ];
        if backend_tx.send(message).is_err() {
            return Ok(());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::types::TaskId;
    use std::collections::HashMap;

    fn empty_snapshot(dir: &std::path::Path) -> Arc<DatabaseSnapshot> {
        Arc::new(DatabaseSnapshot::new(
            1,
            dir.to_path_buf(),
            vec![],
            HashMap::new(),
            DatabaseConfig::new(),
            vec![],
        ))
    }

    #[test]
    fn test_worker_announces_ready_then_answers_ping() {
        let dir = tempfile::TempDir::new().unwrap();
        let (backend_tx, backend_rx) = crossbeam_channel::unbounded::<Multipart>();
        let (worker_tx, worker_rx) = crossbeam_channel::unbounded::<Multipart>();
        let cell = Arc::new(WorkerCell::new());

        let handle = spawn_worker(
            WorkerId::new("3"),
            backend_tx,
            worker_rx,
            Arc::clone(&cell),
        );

        // Ready announcement: [id][""][Ready]
        let mut reader = FrameReader::new(backend_rx.recv().unwrap());
        assert_eq!(reader.next_str().unwrap(), "3");
        reader.expect_empty().unwrap();
        assert_eq!(
            NetAction::decode(&reader.next_frame().unwrap()).unwrap(),
            NetAction::Ready
        );

        // Assign and dispatch a ping.
        cell.assign(
            Task::new(TaskId::from_raw(1), "ping;", "deadbeef"),
            empty_snapshot(dir.path()),
        );
        worker_tx
            .send(vec![
                Frame::from("client-1"),
                Frame::empty(),
                Frame::from("ping;"),
            ])
            .unwrap();

        // Response: [id][""][Response][""][client][""][reply]
        let mut reader = FrameReader::new(backend_rx.recv().unwrap());
        assert_eq!(reader.next_str().unwrap(), "3");
        reader.expect_empty().unwrap();
        assert_eq!(
            NetAction::decode(&reader.next_frame().unwrap()).unwrap(),
            NetAction::Response
        );
        reader.expect_empty().unwrap();
        assert_eq!(reader.next_str().unwrap(), "client-1");
        reader.expect_empty().unwrap();
        let reply = reader.next_str().unwrap();
        assert_eq!(reply, r#"{"type":"ping","connection_id":"deadbeef"}"#);

        // The executed task is back in the cell for commit.
        assert!(cell.take_task().is_some());

        // Closing the inbox shuts the worker down cleanly.
        drop(worker_tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_worker_terminates_on_framing_violation() {
        let dir = tempfile::TempDir::new().unwrap();
        let (backend_tx, backend_rx) = crossbeam_channel::unbounded::<Multipart>();
        let (worker_tx, worker_rx) = crossbeam_channel::unbounded::<Multipart>();
        let cell = Arc::new(WorkerCell::new());

        let handle = spawn_worker(
            WorkerId::new("0"),
            backend_tx,
            worker_rx,
            Arc::clone(&cell),
        );
        let _ready = backend_rx.recv().unwrap();

        cell.assign(
            Task::new(TaskId::from_raw(1), "ping;", "aa"),
            empty_snapshot(dir.path()),
        );
        // Non-empty separator where the empty frame belongs.
        worker_tx
            .send(vec![
                Frame::from("client-1"),
                Frame::from("not-empty"),
                Frame::from("ping;"),
            ])
            .unwrap();

        // The worker dies instead of answering; its backend sender is gone.
        handle.join().unwrap();
        assert!(backend_rx.recv().is_err());
    }
}
