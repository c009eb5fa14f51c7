//! Live session tracking: at most one bidirectional session per node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use pf_core::error::CoreError;
use pf_core::types::ProbeTool;

use crate::protocol::{ResponseFrame, ServerFrame};

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// How a pending job resolved from the session's point of view.
#[derive(Debug)]
pub enum JobOutcome {
    Response(ResponseFrame),
    Disconnected,
}

/// One outstanding dispatch awaiting its correlated response.
pub struct JobRecord {
    pub tool: ProbeTool,
    pub target: String,
    pub dispatched_at: Instant,
    pub waiter: oneshot::Sender<JobOutcome>,
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Shared state of one live node session.
///
/// The WebSocket task owns the transport; everything else (dispatcher,
/// liveness patrol) talks to the session through this handle.
pub struct SessionHandle {
    pub connection_id: Uuid,
    pub node_uuid: Uuid,
    pub opened_at: Instant,
    last_rx: Mutex<Instant>,
    pending: Mutex<HashMap<Uuid, JobRecord>>,
    outbound: mpsc::Sender<ServerFrame>,
    close_requested: AtomicBool,
    close_notify: Notify,
}

impl SessionHandle {
    pub fn new(node_uuid: Uuid, outbound: mpsc::Sender<ServerFrame>) -> Arc<Self> {
        Arc::new(Self {
            connection_id: Uuid::new_v4(),
            node_uuid,
            opened_at: Instant::now(),
            last_rx: Mutex::new(Instant::now()),
            pending: Mutex::new(HashMap::new()),
            outbound,
            close_requested: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    /// Record frame receipt for liveness tracking.
    pub fn touch_rx(&self) {
        *self.last_rx.lock().expect("session last_rx lock poisoned") = Instant::now();
    }

    pub fn last_rx_elapsed(&self) -> Duration {
        self.last_rx
            .lock()
            .expect("session last_rx lock poisoned")
            .elapsed()
    }

    /// Queue an outbound frame for the transport task.
    pub async fn send(&self, frame: ServerFrame) -> Result<(), CoreError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| CoreError::NodeDisconnected)
    }

    /// Track a new pending job. Fails when the session is already closing.
    pub fn register_job(&self, request_id: Uuid, job: JobRecord) -> Result<(), CoreError> {
        if self.is_closing() {
            return Err(CoreError::NodeDisconnected);
        }
        let mut pending = self.pending.lock().expect("session pending lock poisoned");
        pending.insert(request_id, job);
        Ok(())
    }

    /// Atomically remove a pending job, if it is still pending.
    pub fn take_job(&self, request_id: Uuid) -> Option<JobRecord> {
        let mut pending = self.pending.lock().expect("session pending lock poisoned");
        pending.remove(&request_id)
    }

    /// Resolve a pending job with its response.
    ///
    /// Returns `false` when no job with this id is pending — a late or
    /// duplicate response; it is discarded silently.
    pub fn complete_job(&self, request_id: Uuid, response: ResponseFrame) -> bool {
        match self.take_job(request_id) {
            Some(job) => {
                let _ = job.waiter.send(JobOutcome::Response(response));
                true
            }
            None => false,
        }
    }

    /// Resolve every pending job with `Disconnected`.
    pub fn fail_all_pending(&self) {
        let drained: Vec<(Uuid, JobRecord)> = {
            let mut pending = self.pending.lock().expect("session pending lock poisoned");
            pending.drain().collect()
        };
        if !drained.is_empty() {
            warn!(
                node_uuid = %self.node_uuid,
                count = drained.len(),
                "resolving pending jobs as disconnected"
            );
        }
        for (_, job) in drained {
            let _ = job.waiter.send(JobOutcome::Disconnected);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .expect("session pending lock poisoned")
            .len()
    }

    /// Ask the transport task to close this session.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }

    pub fn is_closing(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    /// Resolves when a close has been requested.
    pub async fn closed(&self) {
        if self.is_closing() {
            return;
        }
        self.close_notify.notified().await;
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// The live session map. Binding is first-wins: a second session for the
/// same node_uuid is refused while the first is attached.
pub struct SessionRegistry {
    live: DashMap<Uuid, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            live: DashMap::new(),
        }
    }

    /// Attach a session for its node. Fails with `Conflict` when a live
    /// session already exists for the node_uuid.
    pub fn bind(&self, session: Arc<SessionHandle>) -> Result<(), CoreError> {
        match self.live.entry(session.node_uuid) {
            Entry::Occupied(_) => Err(CoreError::Conflict(format!(
                "node {} already has a live session",
                session.node_uuid
            ))),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Detach a session, but only the one identified by `connection_id`;
    /// a successor session attached later is left alone.
    pub fn unbind(&self, node_uuid: Uuid, connection_id: Uuid) -> Option<Arc<SessionHandle>> {
        self.live
            .remove_if(&node_uuid, |_, s| s.connection_id == connection_id)
            .map(|(_, s)| s)
    }

    pub fn get(&self, node_uuid: Uuid) -> Option<Arc<SessionHandle>> {
        self.live.get(&node_uuid).map(|s| s.clone())
    }

    pub fn contains(&self, node_uuid: Uuid) -> bool {
        self.live.contains_key(&node_uuid)
    }

    pub fn all(&self) -> Vec<Arc<SessionHandle>> {
        self.live.iter().map(|s| s.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.live.len()
    }

    /// Request close on every session whose last receive is older than the
    /// staleness threshold. Returns the node ids that were flagged.
    pub fn close_stale(&self, threshold: Duration) -> Vec<Uuid> {
        let mut stale = Vec::new();
        for session in self.all() {
            if session.last_rx_elapsed() > threshold && !session.is_closing() {
                debug!(
                    node_uuid = %session.node_uuid,
                    idle_secs = session.last_rx_elapsed().as_secs(),
                    "flagging stale session for close"
                );
                session.request_close();
                stale.push(session.node_uuid);
            }
        }
        stale
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
