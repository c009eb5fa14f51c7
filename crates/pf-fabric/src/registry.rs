//! Node registry: durable probe-node records, registration tokens, and
//! heartbeat ingestion.
//!
//! The in-memory map is authoritative at runtime; every mutation is written
//! through to the state store. Records are never deleted — deactivation is
//! a terminal status.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use pf_core::error::CoreError;
use pf_core::store::StateDb;
use pf_core::types::{NodeStatus, ProbeNode, ProbeTool, RegistrationToken};

/// Registration tokens live at most one week.
const MAX_TOKEN_EXPIRY_HOURS: i64 = 168;

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

/// Attributes supplied at node registration.
#[derive(Debug, Clone)]
pub struct RegisterAttrs {
    pub name: String,
    pub hostname: Option<String>,
    pub region: String,
    pub zone: Option<String>,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
    pub version: Option<String>,
    pub supported_tools: Option<BTreeSet<ProbeTool>>,
}

/// Admin-editable node fields. Everything else is owned by the fabric.
/// Mutations act on the record only — a live session is never affected.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub priority: Option<i32>,
    pub max_concurrent_probes: Option<u32>,
    pub supported_tools: Option<BTreeSet<ProbeTool>>,
    /// Administrative status override (e.g. re-activation). Deactivation is
    /// terminal and cannot be overridden here.
    pub status: Option<NodeStatus>,
}

/// Metrics carried by an HTTP heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatMetrics {
    pub current_load: f64,
    pub avg_response_time: f64,
    /// Errors since the previous heartbeat (additive).
    pub error_count: u32,
    pub version: Option<String>,
}

// ---------------------------------------------------------------------------
// NodeRegistry
// ---------------------------------------------------------------------------

pub struct NodeRegistry {
    nodes: DashMap<Uuid, ProbeNode>,
    db: Arc<StateDb>,
}

impl NodeRegistry {
    /// Load the registry from the state store.
    ///
    /// Previously `active` nodes are downgraded to `disconnected`: sessions
    /// do not survive a restart.
    pub async fn load(db: Arc<StateDb>) -> Result<Arc<Self>, CoreError> {
        let downgraded = db.mark_all_disconnected().await?;
        if downgraded > 0 {
            info!(downgraded, "downgraded stale active nodes at boot");
        }

        let nodes = DashMap::new();
        for node in db.list_nodes().await? {
            nodes.insert(node.node_uuid, node);
        }
        info!(count = nodes.len(), "node registry loaded");
        Ok(Arc::new(Self { nodes, db }))
    }

    // -----------------------------------------------------------------------
    // Registration tokens
    // -----------------------------------------------------------------------

    /// Mint a one-shot registration token (admin operation).
    pub async fn create_token(
        &self,
        description: String,
        expiry_hours: i64,
        intended_region: Option<String>,
        created_by: Option<i64>,
    ) -> Result<RegistrationToken, CoreError> {
        if !(1..=MAX_TOKEN_EXPIRY_HOURS).contains(&expiry_hours) {
            return Err(CoreError::Invalid(format!(
                "expiry_hours must be within 1..={}, got {}",
                MAX_TOKEN_EXPIRY_HOURS, expiry_hours
            )));
        }

        let now = Utc::now();
        let token = RegistrationToken {
            token: format!("pnreg_{}", random_hex(16)?),
            description,
            created_by,
            intended_region,
            created_at: now,
            expires_at: now + ChronoDuration::hours(expiry_hours),
            is_used: false,
            used_at: None,
            node_uuid: None,
        };
        self.db.insert_token(&token).await?;
        info!(expires_at = %token.expires_at, "registration token created");
        Ok(token)
    }

    pub async fn list_tokens(
        &self,
        include_used: bool,
        include_expired: bool,
    ) -> Result<Vec<RegistrationToken>, CoreError> {
        Ok(self.db.list_tokens(include_used, include_expired).await?)
    }

    /// Revoke a token: marks it used and expires it immediately.
    pub async fn revoke_token(&self, token: &str) -> Result<(), CoreError> {
        if self.db.revoke_token(token).await? {
            info!("registration token revoked");
            Ok(())
        } else {
            Err(CoreError::NotFound("registration token not found".into()))
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Exchange a registration token for a fresh node identity.
    ///
    /// Token consumption and node insertion are one transaction: a token
    /// mints at most one node no matter how many registrations race on it.
    pub async fn register(&self, token: &str, attrs: RegisterAttrs) -> Result<ProbeNode, CoreError> {
        let api_key = format!("pnode_{}", random_hex(24)?);
        let mut node = ProbeNode::new(attrs.name, attrs.region, api_key);
        node.hostname = attrs.hostname;
        node.zone = attrs.zone;
        node.internal_ip = attrs.internal_ip;
        node.external_ip = attrs.external_ip;
        node.version = attrs.version;
        if let Some(tools) = attrs.supported_tools {
            node.supported_tools = tools;
        }

        let minted = self
            .db
            .register_node(token.to_string(), node)
            .await?
            .ok_or_else(|| {
                warn!("node registration with invalid or expired token");
                CoreError::Unauthenticated("invalid or expired registration token".into())
            })?;

        info!(node_uuid = %minted.node_uuid, name = %minted.name, region = %minted.region, "probe node registered");
        self.nodes.insert(minted.node_uuid, minted.clone());
        Ok(minted)
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    /// Validate a (node_uuid, api_key) pair. Deactivated nodes cannot
    /// authenticate.
    pub fn authenticate(&self, node_uuid: Uuid, api_key: &str) -> Result<ProbeNode, CoreError> {
        let node = self
            .nodes
            .get(&node_uuid)
            .ok_or_else(|| CoreError::Unauthenticated("unknown node".into()))?;

        let matches: bool = node.api_key.as_bytes().ct_eq(api_key.as_bytes()).into();
        if !matches {
            return Err(CoreError::Unauthenticated("invalid node api key".into()));
        }
        if node.status == NodeStatus::Deactivated {
            return Err(CoreError::Unauthenticated("node is deactivated".into()));
        }
        Ok(node.clone())
    }

    // -----------------------------------------------------------------------
    // Session lifecycle hooks
    // -----------------------------------------------------------------------

    /// Record a successful session bind.
    pub async fn mark_connected(
        &self,
        node_uuid: Uuid,
        connection_id: Uuid,
        version: Option<String>,
        hostname: Option<String>,
    ) -> Result<ProbeNode, CoreError> {
        let snapshot = self.mutate(node_uuid, |node| {
            let now = Utc::now();
            node.status = NodeStatus::Active;
            node.last_heartbeat = Some(now);
            node.last_connected = Some(now);
            node.connection_id = Some(connection_id);
            node.reconnect_count += 1;
            if let Some(v) = version {
                node.version = Some(v);
            }
            if let Some(h) = hostname {
                node.hostname = Some(h);
            }
        })?;
        self.db.upsert_node(&snapshot).await?;
        Ok(snapshot)
    }

    /// Record a session close. The node keeps its terminal status if it was
    /// deactivated while connected.
    pub async fn mark_disconnected(
        &self,
        node_uuid: Uuid,
        connection_id: Uuid,
    ) -> Result<(), CoreError> {
        let snapshot = self.mutate(node_uuid, |node| {
            if node.connection_id == Some(connection_id) {
                node.connection_id = None;
            }
            if node.status != NodeStatus::Deactivated {
                node.status = NodeStatus::Disconnected;
            }
        })?;
        self.db.upsert_node(&snapshot).await?;
        Ok(())
    }

    /// Apply a session heartbeat frame.
    pub async fn session_heartbeat(
        &self,
        node_uuid: Uuid,
        current_load: Option<f64>,
        error_count: Option<u32>,
        version: Option<String>,
    ) -> Result<(), CoreError> {
        let snapshot = self.mutate(node_uuid, |node| {
            node.last_heartbeat = Some(Utc::now());
            if let Some(load) = current_load {
                node.current_load = load.clamp(0.0, 1.0);
            }
            if let Some(errors) = error_count {
                node.error_count = errors;
            }
            if let Some(v) = version {
                node.version = Some(v);
            }
        })?;
        self.db.upsert_node(&snapshot).await?;
        Ok(())
    }

    /// Apply an HTTP heartbeat (the fallback path for nodes without a live
    /// session).
    ///
    /// When a live session exists the heartbeat is accepted but only the
    /// timestamp is refreshed — the session remains the source of truth.
    pub async fn http_heartbeat(
        &self,
        node_uuid: Uuid,
        api_key: &str,
        metrics: HeartbeatMetrics,
        has_live_session: bool,
    ) -> Result<ProbeNode, CoreError> {
        self.authenticate(node_uuid, api_key)?;

        let snapshot = self.mutate(node_uuid, |node| {
            node.last_heartbeat = Some(Utc::now());
            if has_live_session {
                return;
            }
            node.current_load = metrics.current_load.clamp(0.0, 1.0);
            node.avg_response_time = metrics.avg_response_time;
            node.error_count = node.error_count.saturating_add(metrics.error_count);
            if let Some(v) = metrics.version.clone() {
                node.version = Some(v);
            }
            if node.status == NodeStatus::Error {
                node.status = NodeStatus::Active;
            }
        })?;
        self.db.upsert_node(&snapshot).await?;
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Job accounting
    // -----------------------------------------------------------------------

    /// Record a completed job: bump the execution counter and fold the
    /// observed round-trip into the response-time moving average (α = 0.2).
    pub async fn record_job_success(
        &self,
        node_uuid: Uuid,
        round_trip_ms: f64,
    ) -> Result<(), CoreError> {
        let snapshot = self.mutate(node_uuid, |node| {
            node.total_probes_executed += 1;
            node.avg_response_time = if node.total_probes_executed == 1 {
                round_trip_ms
            } else {
                0.2 * round_trip_ms + 0.8 * node.avg_response_time
            };
        })?;
        self.db.upsert_node(&snapshot).await?;
        Ok(())
    }

    /// Record a job that hit its deadline.
    pub async fn record_job_timeout(&self, node_uuid: Uuid) -> Result<(), CoreError> {
        let snapshot = self.mutate(node_uuid, |node| {
            node.error_count = node.error_count.saturating_add(1);
        })?;
        self.db.upsert_node(&snapshot).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Admin operations (record-level; sessions are never touched here)
    // -----------------------------------------------------------------------

    pub fn get(&self, node_uuid: Uuid) -> Option<ProbeNode> {
        self.nodes.get(&node_uuid).map(|n| n.clone())
    }

    pub fn list(
        &self,
        region: Option<&str>,
        status: Option<NodeStatus>,
        active_only: bool,
    ) -> Vec<ProbeNode> {
        let mut nodes: Vec<ProbeNode> = self
            .nodes
            .iter()
            .map(|n| n.clone())
            .filter(|n| region.map(|r| n.region == r).unwrap_or(true))
            .filter(|n| status.map(|s| n.status == s).unwrap_or(true))
            .filter(|n| !active_only || n.status == NodeStatus::Active)
            .collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        nodes
    }

    /// Snapshot every node (dispatch candidate scan).
    pub fn snapshot(&self) -> Vec<ProbeNode> {
        self.nodes.iter().map(|n| n.clone()).collect()
    }

    pub async fn update(&self, node_uuid: Uuid, update: NodeUpdate) -> Result<ProbeNode, CoreError> {
        let snapshot = self.mutate(node_uuid, |node| {
            if let Some(name) = update.name.clone() {
                node.name = name;
            }
            if let Some(region) = update.region.clone() {
                node.region = region;
            }
            if let Some(zone) = update.zone.clone() {
                node.zone = Some(zone);
            }
            if let Some(priority) = update.priority {
                node.priority = priority;
            }
            if let Some(max) = update.max_concurrent_probes {
                node.max_concurrent_probes = max;
            }
            if let Some(tools) = update.supported_tools.clone() {
                node.supported_tools = tools;
            }
            if let Some(status) = update.status {
                if node.status != NodeStatus::Deactivated {
                    node.status = status;
                }
            }
        })?;
        self.db.upsert_node(&snapshot).await?;
        info!(node_uuid = %node_uuid, "probe node updated");
        Ok(snapshot)
    }

    /// Deactivate a node. Terminal: the record stays, the node can never
    /// authenticate again.
    pub async fn deactivate(&self, node_uuid: Uuid) -> Result<(), CoreError> {
        let snapshot = self.mutate(node_uuid, |node| {
            node.status = NodeStatus::Deactivated;
        })?;
        self.db.upsert_node(&snapshot).await?;
        info!(node_uuid = %node_uuid, "probe node deactivated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Apply `f` to the node under the map guard and return an updated
    /// snapshot for write-through. The guard is never held across an await.
    fn mutate(
        &self,
        node_uuid: Uuid,
        f: impl FnOnce(&mut ProbeNode),
    ) -> Result<ProbeNode, CoreError> {
        let mut node = self
            .nodes
            .get_mut(&node_uuid)
            .ok_or_else(|| CoreError::NotFound(format!("node {} not found", node_uuid)))?;
        f(&mut node);
        node.updated_at = Utc::now();
        Ok(node.clone())
    }
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

fn random_hex(bytes: usize) -> Result<String, CoreError> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; bytes];
    rng.fill(&mut buf)
        .map_err(|_| CoreError::Internal("system entropy unavailable".into()))?;
    Ok(buf.iter().map(|b| format!("{:02x}", b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_length_and_charset() {
        let hex = random_hex(24).expect("entropy");
        assert_eq!(hex.len(), 48);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hex, random_hex(24).unwrap());
    }
}
