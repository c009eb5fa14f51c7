//! Job dispatch: pick a node, send the job over its session, await the
//! correlated response under a deadline.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pf_core::config::FabricConfig;
use pf_core::error::CoreError;
use pf_core::types::{ProbeNode, ProbeTool};

use crate::protocol::{JobFrame, ServerFrame};
use crate::registry::NodeRegistry;
use crate::session::{JobOutcome, JobRecord, SessionHandle, SessionRegistry};

// ---------------------------------------------------------------------------
// ProbeSpec / ProbeReport
// ---------------------------------------------------------------------------

/// One probe to execute somewhere on the fabric.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub tool: ProbeTool,
    pub target: String,
    pub parameters: serde_json::Value,
    pub priority: i32,
    /// Optional region preference; `None` considers every region.
    pub region: Option<String>,
    /// Caller deadline override, capped by policy.
    pub timeout: Option<Duration>,
}

/// The resolved outcome of a dispatched probe.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub request_id: Uuid,
    pub node_uuid: Uuid,
    pub result: serde_json::Value,
    pub success: bool,
    /// Tool execution time as reported by the node, seconds.
    pub execution_time: f64,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    sessions: Arc<SessionRegistry>,
    cfg: FabricConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        sessions: Arc<SessionRegistry>,
        cfg: FabricConfig,
    ) -> Self {
        Self {
            registry,
            sessions,
            cfg,
        }
    }

    /// Pick the dispatch target for a job: active, tool-capable, region
    /// match, live session; least loaded wins, ties broken by higher node
    /// priority, then fewer errors.
    pub fn select_node(
        &self,
        tool: ProbeTool,
        region: Option<&str>,
    ) -> Option<(ProbeNode, Arc<SessionHandle>)> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|node| node.is_dispatchable())
            .filter(|node| node.supported_tools.contains(&tool))
            .filter(|node| region.map(|r| node.region == r).unwrap_or(true))
            .filter_map(|node| {
                let session = self.sessions.get(node.node_uuid)?;
                (!session.is_closing()).then_some((node, session))
            })
            .min_by(|(a, _), (b, _)| {
                a.current_load
                    .partial_cmp(&b.current_load)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.priority.cmp(&a.priority))
                    .then_with(|| a.error_count.cmp(&b.error_count))
            })
    }

    /// Deadline for a job: the caller's override, capped by policy.
    fn job_deadline(&self, requested: Option<Duration>) -> Duration {
        let cap = Duration::from_secs(self.cfg.max_job_timeout_secs);
        requested
            .unwrap_or(Duration::from_secs(self.cfg.default_job_timeout_secs))
            .min(cap)
    }

    /// Dispatch a probe and await its correlated response.
    ///
    /// Exactly one of {report, `JobTimeout`, `NodeDisconnected`} is
    /// observed; dropping the returned future cancels the job, and a
    /// response arriving after that is discarded silently.
    pub async fn dispatch(&self, spec: ProbeSpec) -> Result<ProbeReport, CoreError> {
        let (node, session) = self
            .select_node(spec.tool, spec.region.as_deref())
            .ok_or(CoreError::NoNodeAvailable)?;

        let request_id = Uuid::new_v4();
        let deadline = self.job_deadline(spec.timeout);
        let started = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        session.register_job(
            request_id,
            JobRecord {
                tool: spec.tool,
                target: spec.target.clone(),
                dispatched_at: started,
                waiter: tx,
            },
        )?;
        let guard = PendingGuard::new(session.clone(), request_id);

        let frame = ServerFrame::DiagnosticJob(JobFrame {
            request_id,
            tool: spec.tool,
            target: spec.target.clone(),
            parameters: spec.parameters.clone(),
            priority: spec.priority,
            timeout: deadline.as_secs(),
            timestamp: Utc::now().to_rfc3339(),
        });
        if session.send(frame).await.is_err() {
            // Transport gone before the job left; the guard clears pending.
            return Err(CoreError::NodeDisconnected);
        }
        info!(
            request_id = %request_id,
            node_uuid = %node.node_uuid,
            tool = %spec.tool,
            target = %spec.target,
            deadline_secs = deadline.as_secs(),
            "diagnostic job dispatched"
        );

        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(JobOutcome::Response(response))) => {
                guard.disarm();
                let round_trip_ms = started.elapsed().as_secs_f64() * 1000.0;
                if let Err(e) = self
                    .registry
                    .record_job_success(node.node_uuid, round_trip_ms)
                    .await
                {
                    warn!(node_uuid = %node.node_uuid, error = %e, "failed to record job stats");
                }
                Ok(ProbeReport {
                    request_id,
                    node_uuid: node.node_uuid,
                    result: response.result,
                    success: response.success,
                    execution_time: response.execution_time,
                })
            }
            Ok(Ok(JobOutcome::Disconnected)) | Ok(Err(_)) => {
                guard.disarm();
                Err(CoreError::NodeDisconnected)
            }
            Err(_elapsed) => {
                if session.take_job(request_id).is_some() {
                    guard.disarm();
                    if let Err(e) = self.registry.record_job_timeout(node.node_uuid).await {
                        warn!(node_uuid = %node.node_uuid, error = %e, "failed to record job timeout");
                    }
                    debug!(request_id = %request_id, node_uuid = %node.node_uuid, "job deadline expired");
                    Err(CoreError::JobTimeout)
                } else {
                    // The response (or a disconnect) raced the deadline.
                    guard.disarm();
                    match rx.await {
                        Ok(JobOutcome::Response(response)) => Ok(ProbeReport {
                            request_id,
                            node_uuid: node.node_uuid,
                            result: response.result,
                            success: response.success,
                            execution_time: response.execution_time,
                        }),
                        _ => Err(CoreError::NodeDisconnected),
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PendingGuard
// ---------------------------------------------------------------------------

/// Removes the pending job record when the dispatch future is dropped
/// before resolving (caller cancellation). A late response then finds
/// nothing pending and is discarded.
struct PendingGuard {
    session: Arc<SessionHandle>,
    request_id: Uuid,
    armed: bool,
}

impl PendingGuard {
    fn new(session: Arc<SessionHandle>, request_id: Uuid) -> Self {
        Self {
            session,
            request_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed && self.session.take_job(self.request_id).is_some() {
            debug!(request_id = %self.request_id, "cancelled job removed from pending map");
        }
    }
}
