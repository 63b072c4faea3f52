//! # Coordinator
//!
//! The single-threaded owner of all scheduling and arbitration state: the
//! database registry, the worker contexts, the idle-worker queue and the
//! lock bookkeeping. Everything it owns is touched only from its own event
//! loop. Workers reach it exclusively through messages, which is what makes
//! deadlock impossible (no hold-and-wait across threads) and keeps lock
//! state out of shared memory.
//!
//! ## Event Loop
//!
//! ```text
//!        ┌────────────┐   [client][""][request]    ┌─────────────┐
//!  clients ──────────▶│  frontend  │──────────────▶│             │
//!        └────────────┘                            │ coordinator │
//!        ┌────────────┐  [worker][""][action]...   │  (1 thread) │
//!  workers ──────────▶│  backend   │──────────────▶│             │
//!        └────────────┘                            └─────────────┘
//! ```
//!
//! The backend is always polled; the frontend only while at least one worker
//! is idle. That asymmetry is the admission control: a request is never read
//! off the frontend unless a worker can take it immediately.
//!
//! ## Scheduling
//!
//! Idle workers queue FIFO, least-recently-used at the front. A worker is
//! re-queued the moment its `Ready` or `Response` arrives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, error, info};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::frames::{Frame, FrameReader, Multipart, NetAction, NetLockResp};
use crate::snapshot::DatabaseSnapshot;
use crate::types::{DatasetId, IteratorId, TaskId, WorkerId};
use crate::worker::WorkerCell;

// =============================================================================
// Worker Context
// =============================================================================

/// What the coordinator knows about one worker.
#[derive(Debug)]
struct WorkerContext {
    /// Channel into the worker's inbox (dispatches and lock replies).
    outbox: Sender<Multipart>,
    /// Handoff slot shared with the worker thread.
    cell: Arc<WorkerCell>,
    /// The snapshot assigned for the worker's current task, if any. Lock
    /// grants are recorded on it.
    snapshot: Option<Arc<DatabaseSnapshot>>,
    /// The task the worker is executing, if any. A worker with no active
    /// task holds no effective locks.
    active_task: Option<TaskId>,
}

// =============================================================================
// Coordinator
// =============================================================================

/// The coordinator event loop and its state.
pub struct Coordinator {
    db: Database,
    backend_rx: Receiver<Multipart>,
    frontend_rx: Receiver<Multipart>,
    frontend_tx: Sender<Multipart>,
    wctxs: HashMap<WorkerId, WorkerContext>,
    worker_queue: VecDeque<WorkerId>,
}

impl Coordinator {
    /// Creates a coordinator over its three channels. Workers are attached
    /// afterwards with [`Coordinator::register_worker`].
    pub fn new(
        db: Database,
        backend_rx: Receiver<Multipart>,
        frontend_rx: Receiver<Multipart>,
        frontend_tx: Sender<Multipart>,
    ) -> Self {
        Self {
            db,
            backend_rx,
            frontend_rx,
            frontend_tx,
            wctxs: HashMap::new(),
            worker_queue: VecDeque::new(),
        }
    }

    /// Registers a worker's outbox and handoff cell.
    ///
    /// The worker is *not* queued as idle here; it announces itself with
    /// `Ready` like everyone else.
    pub fn register_worker(
        &mut self,
        worker_id: WorkerId,
        outbox: Sender<Multipart>,
        cell: Arc<WorkerCell>,
    ) {
        self.wctxs.insert(
            worker_id,
            WorkerContext {
                outbox,
                cell,
                snapshot: None,
                active_task: None,
            },
        );
    }

    /// The owned database, for inspection after the loop has exited.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Runs the event loop until shutdown (all counterpart channels closed)
    /// or a protocol violation.
    ///
    /// A protocol violation is the only error: it terminates the loop
    /// before any further state change, per the framing discipline.
    pub fn run(&mut self) -> Result<()> {
        // Local clones so the select arms can borrow `self` mutably.
        let backend_rx = self.backend_rx.clone();
        let frontend_rx = self.frontend_rx.clone();

        loop {
            if self.worker_queue.is_empty() {
                // No idle worker: taking a client request now could only
                // park it, so the frontend is not polled at all.
                match backend_rx.recv() {
                    Ok(message) => self.poll_backend(message)?,
                    Err(_) => return Ok(()),
                }
            } else {
                select! {
                    recv(backend_rx) -> message => match message {
                        Ok(message) => self.poll_backend(message)?,
                        Err(_) => return Ok(()),
                    },
                    recv(frontend_rx) -> message => match message {
                        Ok(message) => self.poll_frontend(message)?,
                        Err(_) => return Ok(()),
                    },
                }
            }
        }
    }

    // =========================================================================
    // Backend
    // =========================================================================

    /// Handles one worker message: `[worker-addr][""][action]…`.
    fn poll_backend(&mut self, message: Multipart) -> Result<()> {
        let mut reader = FrameReader::new(message);
        let worker_addr = WorkerId::new(reader.next_str()?);
        reader.expect_empty()?;
        let action = NetAction::decode(&reader.next_frame()?)?;

        if !self.wctxs.contains_key(&worker_addr) {
            return Err(Error::Protocol(format!(
                "message from unregistered worker '{}'",
                worker_addr
            )));
        }

        match action {
            NetAction::Ready => {
                self.worker_queue.push_back(worker_addr);
            }
            NetAction::Response => {
                self.worker_queue.push_back(worker_addr.clone());
                self.handle_response(&worker_addr, reader)?;
            }
            NetAction::DatasetLockReq => {
                self.handle_dataset_lock_req(&worker_addr, reader)?;
            }
            NetAction::IteratorLockReq => {
                self.handle_iterator_lock_req(&worker_addr, reader)?;
            }
        }
        Ok(())
    }

    /// `[""][client-addr][""][reply]`: forward the reply, commit the task,
    /// collect garbage.
    fn handle_response(&mut self, worker_addr: &WorkerId, mut reader: FrameReader) -> Result<()> {
        reader.expect_empty()?;
        let client_addr = reader.next_str()?;
        reader.expect_empty()?;
        let reply = reader.next_str()?;

        let _ = self.frontend_tx.send(vec![
            Frame::from(client_addr),
            Frame::empty(),
            Frame::from(reply),
        ]);

        self.commit_task(worker_addr)?;

        // Retire every snapshot no active task references.
        let working: HashSet<u64> = self
            .wctxs
            .values()
            .filter(|ctx| ctx.active_task.is_some())
            .filter_map(|ctx| ctx.snapshot.as_ref().map(|snap| snap.generation()))
            .collect();
        self.db.collect_garbage(&working);
        Ok(())
    }

    /// Applies the finished task's staged changes and releases its locks
    /// (implicitly: a worker without an active task holds none).
    fn commit_task(&mut self, worker_addr: &WorkerId) -> Result<()> {
        let ctx = self
            .wctxs
            .get_mut(worker_addr)
            .expect("worker validated in poll_backend");
        let task = ctx.cell.take_task().ok_or_else(|| {
            Error::Protocol(format!("response from '{}' without a task", worker_addr))
        })?;
        let task_id = task.id();
        ctx.active_task = None;
        ctx.snapshot = None;

        info!(task = %task_id, worker = %worker_addr, "task finished");

        if let Err(err) = self.db.commit_task(task) {
            // The reply is already on its way to the client; all that's
            // left is to drop the staged changes and make noise.
            error!(task = %task_id, error = %err, "commit rejected, staged changes discarded");
        }
        Ok(())
    }

    /// `([""][name])*[""][""]`: an all-or-nothing multi-name dataset lock
    /// request.
    fn handle_dataset_lock_req(
        &mut self,
        worker_addr: &WorkerId,
        mut reader: FrameReader,
    ) -> Result<()> {
        let mut names = Vec::new();
        loop {
            reader.expect_empty()?;
            let name = reader.next_str()?;
            if name.is_empty() {
                break;
            }
            names.push(DatasetId::new(name));
        }

        let conflict = names
            .iter()
            .any(|name| self.dataset_locked_by_other(worker_addr, name));

        let verdict = if conflict {
            NetLockResp::LockDenied
        } else {
            let ctx = self
                .wctxs
                .get(worker_addr)
                .expect("worker validated in poll_backend");
            let snap = ctx.snapshot.as_ref().ok_or_else(|| {
                Error::Protocol(format!(
                    "lock request from '{}' without an active task",
                    worker_addr
                ))
            })?;
            for name in names {
                snap.mark_dataset_locked(name);
            }
            NetLockResp::LockOk
        };

        debug!(worker = %worker_addr, ?verdict, "dataset lock request");
        self.send_lock_reply(worker_addr, verdict);
        Ok(())
    }

    /// `[""][name][""]`: a single iterator lock request.
    fn handle_iterator_lock_req(
        &mut self,
        worker_addr: &WorkerId,
        mut reader: FrameReader,
    ) -> Result<()> {
        reader.expect_empty()?;
        let name = IteratorId::new(reader.next_str()?);
        reader.expect_empty()?;

        let conflict = self.iterator_locked_by_other(worker_addr, &name);

        let verdict = if conflict {
            NetLockResp::LockDenied
        } else {
            let ctx = self
                .wctxs
                .get(worker_addr)
                .expect("worker validated in poll_backend");
            let snap = ctx.snapshot.as_ref().ok_or_else(|| {
                Error::Protocol(format!(
                    "lock request from '{}' without an active task",
                    worker_addr
                ))
            })?;
            snap.mark_iterator_locked(name);
            NetLockResp::LockOk
        };

        debug!(worker = %worker_addr, ?verdict, "iterator lock request");
        self.send_lock_reply(worker_addr, verdict);
        Ok(())
    }

    fn dataset_locked_by_other(&self, requester: &WorkerId, name: &DatasetId) -> bool {
        self.wctxs.iter().any(|(id, ctx)| {
            id != requester
                && ctx.active_task.is_some()
                && ctx
                    .snapshot
                    .as_ref()
                    .is_some_and(|snap| snap.is_dataset_locked(name))
        })
    }

    fn iterator_locked_by_other(&self, requester: &WorkerId, name: &IteratorId) -> bool {
        self.wctxs.iter().any(|(id, ctx)| {
            id != requester
                && ctx.active_task.is_some()
                && ctx
                    .snapshot
                    .as_ref()
                    .is_some_and(|snap| snap.is_iterator_locked(name))
        })
    }

    /// Reply shape: `[worker-id][""][LockOk|LockDenied]`. A send failure
    /// means the worker died; the lock state is already consistent either
    /// way.
    fn send_lock_reply(&self, worker_addr: &WorkerId, verdict: NetLockResp) {
        if let Some(ctx) = self.wctxs.get(worker_addr) {
            let _ = ctx.outbox.send(vec![
                Frame::from(worker_addr.as_str()),
                Frame::empty(),
                verdict.encode(),
            ]);
        }
    }

    // =========================================================================
    // Frontend
    // =========================================================================

    /// `[client-addr][""][request]`: allocate a task, refresh the LRU
    /// worker's snapshot, forward the request.
    fn poll_frontend(&mut self, message: Multipart) -> Result<()> {
        let mut reader = FrameReader::new(message);
        let client_addr = reader.next_str()?;
        reader.expect_empty()?;
        let request = reader.next_str()?;

        // Admission control guarantees this pop succeeds.
        let worker_addr = self.worker_queue.pop_front().ok_or_else(|| {
            Error::Protocol("frontend polled with no idle worker".to_string())
        })?;

        let task = self.db.allocate_task(&request, &client_addr);
        let task_id = task.id();
        // The refresh point: the worker observes every change committed by
        // previously finished tasks.
        let snap = self.db.snapshot();

        let ctx = self
            .wctxs
            .get_mut(&worker_addr)
            .expect("queued workers are registered");
        ctx.cell.assign(task, Arc::clone(&snap));
        ctx.snapshot = Some(snap);
        ctx.active_task = Some(task_id);

        info!(task = %task_id, worker = %worker_addr, request = %request, "task dispatched");

        let _ = ctx.outbox.send(vec![
            Frame::from(client_addr),
            Frame::empty(),
            Frame::from(request),
        ]);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
