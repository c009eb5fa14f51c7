use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ProbeTool
// ---------------------------------------------------------------------------

/// Diagnostic tools a probe node can execute.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTool {
    Ping,
    Traceroute,
    Dns,
    Http,
    Nmap,
    Curl,
    Whois,
    ReverseDns,
}

impl ProbeTool {
    /// Wire name of the tool (matches the serde representation).
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeTool::Ping => "ping",
            ProbeTool::Traceroute => "traceroute",
            ProbeTool::Dns => "dns",
            ProbeTool::Http => "http",
            ProbeTool::Nmap => "nmap",
            ProbeTool::Curl => "curl",
            ProbeTool::Whois => "whois",
            ProbeTool::ReverseDns => "reverse_dns",
        }
    }

    /// The default tool set a node advertises when registration omits one.
    pub fn default_set() -> BTreeSet<ProbeTool> {
        [
            ProbeTool::Ping,
            ProbeTool::Traceroute,
            ProbeTool::Dns,
            ProbeTool::Http,
        ]
        .into_iter()
        .collect()
    }
}

impl fmt::Display for ProbeTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// NodeStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a probe node. `Deactivated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Registered,
    Active,
    Disconnected,
    Deactivated,
    Error,
}

// ---------------------------------------------------------------------------
// TierLimits
// ---------------------------------------------------------------------------

/// Quotas and feature flags for one subscription tier.
///
/// Once attached to a [`Principal`] this is an immutable snapshot; the
/// catalog replaces whole entries, it never edits them in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub name: String,
    pub rate_per_minute: u32,
    pub rate_per_hour: u32,
    pub rate_per_day: u32,
    pub rate_per_month: u32,
    pub max_concurrent: u32,
    /// Higher priority is served earlier from the admission queue.
    pub priority: i32,
    /// Scheduled-probe intervals (minutes) this tier may use.
    pub allowed_probe_intervals: BTreeSet<u32>,
    pub allow_scheduled_probes: bool,
    pub allow_api_access: bool,
    pub allow_export: bool,
    pub allow_alerts: bool,
    pub allow_custom_intervals: bool,
}

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// The accounting subject for admission.
///
/// Authenticated users and anonymous (IP-bucketed) callers share the
/// admission machinery but never collide in the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum PrincipalId {
    User(i64),
    Anonymous(u32),
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrincipalId::User(id) => write!(f, "user:{}", id),
            PrincipalId::Anonymous(bucket) => write!(f, "anon:{}", bucket),
        }
    }
}

/// A resolved caller: identity plus the tier snapshot taken at resolution.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: PrincipalId,
    pub tier: Arc<TierLimits>,
    /// Set when the principal authenticated with an API key.
    pub api_key_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// ProbeNode
// ---------------------------------------------------------------------------

/// A registered probe node. Records are never deleted; deactivation is a
/// terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeNode {
    pub node_uuid: Uuid,
    pub api_key: String,
    pub name: String,
    pub hostname: Option<String>,
    pub region: String,
    pub zone: Option<String>,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
    pub version: Option<String>,
    pub supported_tools: BTreeSet<ProbeTool>,
    pub priority: i32,
    pub max_concurrent_probes: u32,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_connected: Option<DateTime<Utc>>,
    /// Reported load, clamped to [0, 1].
    pub current_load: f64,
    /// Exponential moving average of job round-trip time, milliseconds.
    pub avg_response_time: f64,
    pub error_count: u32,
    pub total_probes_executed: u64,
    pub reconnect_count: u32,
    /// Present while a live session is bound to this node.
    pub connection_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProbeNode {
    pub fn new(name: impl Into<String>, region: impl Into<String>, api_key: String) -> Self {
        let now = Utc::now();
        Self {
            node_uuid: Uuid::new_v4(),
            api_key,
            name: name.into(),
            hostname: None,
            region: region.into(),
            zone: None,
            internal_ip: None,
            external_ip: None,
            version: None,
            supported_tools: ProbeTool::default_set(),
            priority: 0,
            max_concurrent_probes: 10,
            status: NodeStatus::Registered,
            last_heartbeat: None,
            last_connected: None,
            current_load: 0.0,
            avg_response_time: 0.0,
            error_count: 0,
            total_probes_executed: 0,
            reconnect_count: 0,
            connection_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether dispatch may consider this node at all.
    pub fn is_dispatchable(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

// ---------------------------------------------------------------------------
// RegistrationToken
// ---------------------------------------------------------------------------

/// One-shot bootstrap credential that mints a node identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub description: String,
    pub created_by: Option<i64>,
    pub intended_region: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub used_at: Option<DateTime<Utc>>,
    /// The node this token minted, once consumed.
    pub node_uuid: Option<Uuid>,
}

impl RegistrationToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && self.expires_at > now
    }
}

// ---------------------------------------------------------------------------
// UsageLog
// ---------------------------------------------------------------------------

/// Append-only accounting record, written once per released ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub principal: PrincipalId,
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Handler wall time, seconds.
    pub response_time: f64,
    pub client_addr: String,
    pub tier: String,
    pub api_key_id: Option<i64>,
    pub was_queued: bool,
    /// Time spent parked in the admission queue, seconds.
    pub queue_wait: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
