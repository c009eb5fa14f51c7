//! Frame-level wire protocol between probe nodes and the control plane.
//!
//! Field names are load-bearing: deployed nodes parse them byte-for-byte.
//! The `welcome` and `auth_error` frames are keyed by `status` (a handshake
//! quirk kept for compatibility); every other frame carries a `type` tag.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pf_core::types::ProbeTool;

// ---------------------------------------------------------------------------
// Node -> server
// ---------------------------------------------------------------------------

/// First frame on a fresh connection. Not type-tagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFrame {
    pub node_uuid: Uuid,
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Frames a node may send after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeFrame {
    Heartbeat(HeartbeatFrame),
    DiagnosticResponse(ResponseFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatFrame {
    pub node_uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_load: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_stats: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: Uuid,
    pub result: serde_json::Value,
    pub success: bool,
    /// Tool execution time as measured on the node, seconds.
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

// ---------------------------------------------------------------------------
// Server -> node
// ---------------------------------------------------------------------------

/// Successful handshake reply, keyed by `status = "connected"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeFrame {
    pub status: String,
    pub message: String,
    pub node_uuid: Uuid,
    pub connection_id: Uuid,
    pub reconnect: ReconnectPolicy,
    pub server_time: String,
}

impl WelcomeFrame {
    pub fn new(
        node_name: &str,
        node_uuid: Uuid,
        connection_id: Uuid,
        reconnect: ReconnectPolicy,
    ) -> Self {
        Self {
            status: "connected".to_string(),
            message: format!("Connected successfully as {}", node_name),
            node_uuid,
            connection_id,
            reconnect,
            server_time: Utc::now().to_rfc3339(),
        }
    }
}

/// Reconnect pacing advertised to nodes; the server documents it but does
/// not enforce it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub min_delay: u64,
    pub max_delay: u64,
    pub jitter_factor: f64,
    pub initial_delay: u64,
}

/// Failed handshake reply, keyed by `status = "error"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthErrorFrame {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuthErrorFrame {
    pub fn new(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

/// Type-tagged frames the server sends over an established session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    HeartbeatAck {
        status: String,
        server_time: String,
    },
    DiagnosticJob(JobFrame),
    ResultReceived {
        status: String,
        request_id: Uuid,
    },
}

impl ServerFrame {
    pub fn heartbeat_ack() -> Self {
        ServerFrame::HeartbeatAck {
            status: "ok".to_string(),
            server_time: Utc::now().to_rfc3339(),
        }
    }

    pub fn result_received(request_id: Uuid) -> Self {
        ServerFrame::ResultReceived {
            status: "ok".to_string(),
            request_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFrame {
    pub request_id: Uuid,
    pub tool: ProbeTool,
    pub target: String,
    pub parameters: serde_json::Value,
    pub priority: i32,
    /// Job deadline, seconds.
    pub timeout: u64,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
