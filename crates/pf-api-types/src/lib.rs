//! Request/response DTOs for the probefleet HTTP control surface.
//!
//! Shared between the daemon and any client binary so both sides agree on
//! shapes without dragging fabric internals across the boundary.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pf_core::types::{NodeStatus, ProbeTool};

// ---------------------------------------------------------------------------
// Node registration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub registration_token: String,
    pub name: String,
    pub hostname: Option<String>,
    pub region: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub internal_ip: Option<String>,
    #[serde(default)]
    pub external_ip: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub supported_tools: Option<BTreeSet<ProbeTool>>,
    #[serde(default)]
    pub hardware_info: Option<serde_json::Value>,
    #[serde(default)]
    pub network_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub node_uuid: Uuid,
    pub api_key: String,
    pub status: NodeStatus,
    pub config: serde_json::Value,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Heartbeat (HTTP fallback path)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_uuid: Uuid,
    pub api_key: String,
    pub current_load: f64,
    #[serde(default)]
    pub avg_response_time: f64,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub hardware_stats: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub config_update: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Registration tokens (admin)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    pub description: String,
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: i64,
    #[serde(default)]
    pub region: Option<String>,
}

fn default_expiry_hours() -> i64 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSummary {
    pub token: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub node_uuid: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Node admin views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_uuid: Uuid,
    pub name: String,
    pub region: String,
    pub zone: Option<String>,
    pub status: NodeStatus,
    pub priority: i32,
    pub current_load: f64,
    pub avg_response_time: f64,
    pub error_count: u32,
    pub total_probes_executed: u64,
    pub reconnect_count: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUpdateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_concurrent_probes: Option<u32>,
    #[serde(default)]
    pub supported_tools: Option<BTreeSet<ProbeTool>>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDiagnosticRequest {
    pub tool: ProbeTool,
    pub target: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub region: Option<String>,
    /// Deadline override, seconds; capped by server policy.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub request_id: Uuid,
    pub tool: ProbeTool,
    pub target: String,
    pub node_uuid: Uuid,
    pub result: serde_json::Value,
    pub success: bool,
    /// Tool execution time on the node, seconds.
    pub execution_time: f64,
    pub was_queued: bool,
    /// Time spent waiting for admission, seconds.
    pub queue_wait: f64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
