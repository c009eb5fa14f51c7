//! The HTTP control surface: node registration and heartbeats, admin node
//! and token management, and client diagnostics.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use pf_admission::{AdmissionEngine, RequestMeta};
use pf_api_types::{
    CreateTokenRequest, CreateTokenResponse, DiagnosticReport, HeartbeatRequest,
    HeartbeatResponse, NodeSummary, NodeUpdateRequest, RegisterNodeRequest, RegisterNodeResponse,
    RunDiagnosticRequest, TokenSummary,
};
use pf_core::catalog::TierCatalog;
use pf_core::config::Config;
use pf_core::identity::{IdentityResolver, RequestCredentials};
use pf_core::store::StateDb;
use pf_core::types::{NodeStatus, ProbeNode};
use pf_fabric::dispatcher::ProbeSpec;
use pf_fabric::registry::{HeartbeatMetrics, NodeUpdate, RegisterAttrs};
use pf_fabric::ws::ws_node_handler;
use pf_fabric::Fabric;

use crate::api_error::ApiError;
use crate::auth::AdminAuthLayer;
use crate::scheduler::ProbeScheduler;

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub cfg: Config,
    pub engine: Arc<AdmissionEngine>,
    pub fabric: Arc<Fabric>,
    pub identity: IdentityResolver,
    pub state_db: Arc<StateDb>,
    pub catalog: Arc<TierCatalog>,
    pub scheduler: Arc<ProbeScheduler>,
}

/// Build the full router: open routes, admin routes behind the admin key,
/// and the node WebSocket endpoint.
pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/probe-nodes", get(list_nodes))
        .route(
            "/probe-nodes/registration-token",
            post(create_registration_token).get(list_registration_tokens),
        )
        .route(
            "/probe-nodes/registration-token/{token}",
            delete(revoke_registration_token),
        )
        .route(
            "/probe-nodes/{node_uuid}",
            get(get_node).put(update_node).delete(deactivate_node),
        )
        .layer(AdminAuthLayer::new(state.cfg.daemon.admin_api_key.clone()));

    let ws = Router::new()
        .route("/ws/node", get(ws_node_handler))
        .with_state(state.fabric.clone());

    Router::new()
        .route("/probe-nodes/register", post(register_node))
        .route("/probe-nodes/heartbeat", post(node_heartbeat))
        .route("/diagnostics/run", post(run_diagnostic))
        .route("/healthz", get(healthz))
        .merge(admin)
        .with_state(state)
        .merge(ws)
        .layer(TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Node-facing routes
// ---------------------------------------------------------------------------

async fn register_node(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<Json<RegisterNodeResponse>, ApiError> {
    let node = state
        .fabric
        .registry
        .register(
            &req.registration_token,
            RegisterAttrs {
                name: req.name,
                hostname: req.hostname,
                region: req.region,
                zone: req.zone,
                internal_ip: req.internal_ip,
                external_ip: req.external_ip,
                version: req.version,
                supported_tools: req.supported_tools,
            },
        )
        .await?;

    Ok(Json(RegisterNodeResponse {
        node_uuid: node.node_uuid,
        api_key: node.api_key.clone(),
        status: node.status,
        config: node_config(&state.cfg),
        message: "Node registration successful".to_string(),
    }))
}

async fn node_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    // A live session outranks the HTTP path: the heartbeat is accepted but
    // only refreshes the timestamp.
    let has_live_session = state.fabric.sessions.contains(req.node_uuid);
    state
        .fabric
        .registry
        .http_heartbeat(
            req.node_uuid,
            &req.api_key,
            HeartbeatMetrics {
                current_load: req.current_load,
                avg_response_time: req.avg_response_time,
                error_count: req.error_count,
                version: req.version,
            },
            has_live_session,
        )
        .await?;

    Ok(Json(HeartbeatResponse {
        status: "acknowledged".to_string(),
        config_update: node_config(&state.cfg),
        timestamp: Utc::now(),
    }))
}

fn node_config(cfg: &Config) -> serde_json::Value {
    serde_json::json!({
        "check_interval": cfg.fabric.heartbeat_interval_secs,
    })
}

// ---------------------------------------------------------------------------
// Admin: registration tokens
// ---------------------------------------------------------------------------

async fn create_registration_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTokenRequest>,
) -> Result<Json<CreateTokenResponse>, ApiError> {
    let token = state
        .fabric
        .registry
        .create_token(req.description, req.expiry_hours, req.region, None)
        .await?;
    Ok(Json(CreateTokenResponse {
        token: token.token,
        expires_at: token.expires_at,
        description: token.description,
    }))
}

#[derive(Debug, Deserialize)]
struct TokenListQuery {
    #[serde(default)]
    include_used: bool,
    #[serde(default)]
    include_expired: bool,
}

async fn list_registration_tokens(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenListQuery>,
) -> Result<Json<Vec<TokenSummary>>, ApiError> {
    let tokens = state
        .fabric
        .registry
        .list_tokens(query.include_used, query.include_expired)
        .await?;
    Ok(Json(
        tokens
            .into_iter()
            .map(|t| TokenSummary {
                token: t.token,
                description: t.description,
                created_at: t.created_at,
                expires_at: t.expires_at,
                is_used: t.is_used,
                node_uuid: t.node_uuid,
            })
            .collect(),
    ))
}

async fn revoke_registration_token(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.fabric.registry.revoke_token(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Admin: nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NodeListQuery {
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    status: Option<NodeStatus>,
    #[serde(default)]
    active_only: bool,
}

async fn list_nodes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeListQuery>,
) -> Json<Vec<NodeSummary>> {
    let nodes = state
        .fabric
        .registry
        .list(query.region.as_deref(), query.status, query.active_only);
    Json(
        nodes
            .into_iter()
            .map(|n| node_summary(&state, n))
            .collect(),
    )
}

async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(node_uuid): Path<Uuid>,
) -> Result<Json<NodeSummary>, ApiError> {
    let node = state
        .fabric
        .registry
        .get(node_uuid)
        .ok_or_else(|| pf_core::error::CoreError::NotFound("node not found".into()))?;
    Ok(Json(node_summary(&state, node)))
}

async fn update_node(
    State(state): State<Arc<AppState>>,
    Path(node_uuid): Path<Uuid>,
    Json(req): Json<NodeUpdateRequest>,
) -> Result<Json<NodeSummary>, ApiError> {
    let node = state
        .fabric
        .registry
        .update(
            node_uuid,
            NodeUpdate {
                name: req.name,
                region: req.region,
                zone: req.zone,
                priority: req.priority,
                max_concurrent_probes: req.max_concurrent_probes,
                supported_tools: req.supported_tools,
                status: req.status,
            },
        )
        .await?;
    Ok(Json(node_summary(&state, node)))
}

async fn deactivate_node(
    State(state): State<Arc<AppState>>,
    Path(node_uuid): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.fabric.registry.deactivate(node_uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The admin view never exposes the node's api_key.
fn node_summary(state: &AppState, node: ProbeNode) -> NodeSummary {
    NodeSummary {
        connected: state.fabric.sessions.contains(node.node_uuid),
        node_uuid: node.node_uuid,
        name: node.name,
        region: node.region,
        zone: node.zone,
        status: node.status,
        priority: node.priority,
        current_load: node.current_load,
        avg_response_time: node.avg_response_time,
        error_count: node.error_count,
        total_probes_executed: node.total_probes_executed,
        reconnect_count: node.reconnect_count,
        last_heartbeat: node.last_heartbeat,
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AuthQuery {
    #[serde(default)]
    api_key: Option<String>,
}

async fn run_diagnostic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
    Json(req): Json<RunDiagnosticRequest>,
) -> Result<Json<DiagnosticReport>, ApiError> {
    let client_addr = client_addr_from(&headers);
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or(auth.api_key);
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    let principal = state
        .identity
        .resolve(RequestCredentials {
            api_key: api_key.as_deref(),
            bearer: bearer.as_deref(),
            client_addr: &client_addr,
        })
        .await?;

    // Admission first; the ticket is released on every path below.
    let guard = state
        .engine
        .admit(
            &principal,
            RequestMeta {
                endpoint: "/diagnostics/run".to_string(),
                client_addr: client_addr.clone(),
            },
        )
        .await?;

    let spec = ProbeSpec {
        tool: req.tool,
        target: req.target.clone(),
        parameters: req.parameters.clone().unwrap_or_else(|| serde_json::json!({})),
        priority: principal.tier.priority,
        region: req.region.clone(),
        timeout: req.timeout_secs.map(Duration::from_secs),
    };

    match state.fabric.dispatcher.dispatch(spec).await {
        Ok(report) => {
            let was_queued = guard.was_queued();
            let queue_wait = guard.queue_wait().as_secs_f64();
            guard.complete(report.success);
            Ok(Json(DiagnosticReport {
                request_id: report.request_id,
                tool: req.tool,
                target: req.target,
                node_uuid: report.node_uuid,
                result: report.result,
                success: report.success,
                execution_time: report.execution_time,
                was_queued,
                queue_wait,
                timestamp: Utc::now(),
            }))
        }
        Err(e) => {
            guard.complete(false);
            Err(e.into())
        }
    }
}

/// Client address, best effort: proxy headers first, then "unknown".
fn client_addr_from(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "nodes_connected": state.fabric.sessions.count(),
        "admission_queue": state.engine.queue_len(),
        "principal_accounts": state.engine.account_count(),
        "scheduled_probes": state.scheduler.len(),
    }))
}
