//! # Async API
//!
//! The public entry point. [`GrimDb`] spawns the coordinator and worker
//! threads over a database directory and exposes one async operation:
//! submit a request string, await the reply string.
//!
//! ## Why Async Over Threads?
//!
//! The core is deliberately thread-based: workers block on disk I/O and the
//! coordinator owns its state single-threadedly. The async layer is a thin
//! bridge so that applications juggling many concurrent clients don't burn
//! a thread per in-flight request:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Tokio Runtime                       │
//! │   request() ─┐                           ┌─ request()    │
//! │   request() ─┼── frontend channel ───────┼─ request()    │
//! └──────────────┼───────────────────────────┼───────────────┘
//!                ▼                           ▲ (oneshot per request)
//!      ┌──────────────────┐        ┌──────────────────┐
//!      │   coordinator    │───────▶│   reply router   │
//!      │   (1 thread)     │ replies│   (1 thread)     │
//!      └────────┬─────────┘        └──────────────────┘
//!               │ backend ⇅ dispatch
//!      ┌────────┴─────────┐
//!      │  worker threads  │
//!      └──────────────────┘
//! ```
//!
//! Each request is tagged with a fresh hex connection id; the router thread
//! matches replies back to their oneshot. FIFO across concurrent requests
//! is *not* guaranteed; callers that need ordering must serialize
//! themselves.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::config::ConfigKey;
use crate::coordinator::Coordinator;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::frames::{Frame, FrameReader, Multipart};
use crate::types::WorkerId;
use crate::worker::{spawn_worker, WorkerCell};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>;

// =============================================================================
// GrimDb Handle
// =============================================================================

/// The main async handle.
///
/// `Clone + Send + Sync`: clones share the same service. Dropping handles
/// does not stop the service; call [`GrimDb::shutdown`].
#[derive(Clone)]
pub struct GrimDb {
    frontend_tx: Arc<Mutex<Option<Sender<Multipart>>>>,
    pending: PendingMap,
    next_conn_id: Arc<AtomicU64>,
    coordinator_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    worker_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    router_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    worker_count: usize,
}

impl GrimDb {
    /// Opens a database directory and starts the service with the worker
    /// count from its config (`database_workers`).
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let db = Database::open(directory.as_ref())?;
        let workers = db
            .config()
            .get(ConfigKey::parse("database_workers").expect("database_workers is registered"))
            as usize;
        Self::start(db, workers)
    }

    /// Opens a database directory with an explicit worker count.
    pub fn open_with_workers<P: AsRef<Path>>(directory: P, workers: usize) -> Result<Self> {
        let db = Database::open(directory.as_ref())?;
        Self::start(db, workers.max(1))
    }

    fn start(db: Database, workers: usize) -> Result<Self> {
        let (backend_tx, backend_rx) = crossbeam_channel::unbounded();
        let (frontend_tx, frontend_rx) = crossbeam_channel::unbounded();
        let (replies_tx, replies_rx) = crossbeam_channel::unbounded();

        let mut coordinator = Coordinator::new(db, backend_rx, frontend_rx, replies_tx);

        let mut worker_handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let worker_id = WorkerId::new(n.to_string());
            let (outbox_tx, inbox_rx) = crossbeam_channel::unbounded();
            let cell = Arc::new(WorkerCell::new());
            coordinator.register_worker(worker_id.clone(), outbox_tx, Arc::clone(&cell));
            worker_handles.push(spawn_worker(worker_id, backend_tx.clone(), inbox_rx, cell));
        }
        // The workers hold the only backend senders now: when the last
        // worker exits, the coordinator's backend closes.
        drop(backend_tx);

        let coordinator_handle = thread::Builder::new()
            .name("grimdb-coordinator".to_string())
            .spawn(move || {
                if let Err(err) = coordinator.run() {
                    error!(error = %err, "coordinator terminated");
                }
            })
            .expect("failed to spawn coordinator thread");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let router_pending = Arc::clone(&pending);
        let router_handle = thread::Builder::new()
            .name("grimdb-replies".to_string())
            .spawn(move || {
                while let Ok(message) = replies_rx.recv() {
                    route_reply(&router_pending, message);
                }
            })
            .expect("failed to spawn reply router thread");

        Ok(Self {
            frontend_tx: Arc::new(Mutex::new(Some(frontend_tx))),
            pending,
            next_conn_id: Arc::new(AtomicU64::new(1)),
            coordinator_handle: Arc::new(Mutex::new(Some(coordinator_handle))),
            worker_handles: Arc::new(Mutex::new(worker_handles)),
            router_handle: Arc::new(Mutex::new(Some(router_handle))),
            worker_count: workers,
        })
    }

    /// Number of worker threads in the pool.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Submits one request string and awaits its reply string.
    ///
    /// The reply is the JSON wire form of a `Response`; a recoverable
    /// server-side failure arrives as `{"type":"error",...}`, not as `Err`.
    /// `Err` here means the service itself is gone.
    pub async fn request(&self, request: &str) -> Result<String> {
        let conn_id = format!("{:016x}", self.next_conn_id.fetch_add(1, Ordering::Relaxed));

        let sender = {
            let guard = self.frontend_tx.lock().expect("frontend slot poisoned");
            guard.clone().ok_or(Error::Shutdown)?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(conn_id.clone(), reply_tx);

        let message: Multipart = vec![
            Frame::from(conn_id.as_str()),
            Frame::empty(),
            Frame::from(request),
        ];
        if sender.send(message).is_err() {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&conn_id);
            return Err(Error::Shutdown);
        }

        reply_rx.await.map_err(|_| Error::Shutdown)
    }

    /// Stops the service: closes the frontend, then joins the coordinator,
    /// the workers and the reply router. Idempotent; in-flight requests get
    /// [`Error::Shutdown`].
    pub fn shutdown(&self) {
        // Closing the frontend is the shutdown signal the coordinator sees.
        let _ = self
            .frontend_tx
            .lock()
            .expect("frontend slot poisoned")
            .take();

        if let Some(handle) = self
            .coordinator_handle
            .lock()
            .expect("coordinator handle poisoned")
            .take()
        {
            let _ = handle.join();
        }
        for handle in self
            .worker_handles
            .lock()
            .expect("worker handles poisoned")
            .drain(..)
        {
            let _ = handle.join();
        }
        if let Some(handle) = self
            .router_handle
            .lock()
            .expect("router handle poisoned")
            .take()
        {
            let _ = handle.join();
        }

        // Anyone still waiting gets a Shutdown error via dropped oneshots.
        self.pending.lock().expect("pending map poisoned").clear();
    }
}

/// Matches one `[client-addr][""][reply]` message to its waiting oneshot.
fn route_reply(pending: &PendingMap, message: Multipart) {
    let mut reader = FrameReader::new(message);
    let (conn_id, reply) = match (|| -> Result<(String, String)> {
        let conn_id = reader.next_str()?;
        reader.expect_empty()?;
        let reply = reader.next_str()?;
        Ok((conn_id, reply))
    })() {
        Ok(parts) => parts,
        Err(err) => {
            error!(error = %err, "malformed reply from coordinator");
            return;
        }
    };

    let waiter = pending
        .lock()
        .expect("pending map poisoned")
        .remove(&conn_id);
    match waiter {
        // A send failure means the requester gave up; nothing to do.
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => warn!(conn_id = %conn_id, "reply for unknown connection"),
    }
}

// =============================================================================
// Tests
// =============================================================================
