//! The WebSocket endpoint probe nodes connect to.
//!
//! Connection lifecycle: accept → auth frame within 5 s → bind (one live
//! session per node) → welcome → frame pump. Every close path funnels
//! through [`cleanup_session`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{
    AuthErrorFrame, AuthFrame, NodeFrame, ReconnectPolicy, ServerFrame, WelcomeFrame,
};
use crate::session::SessionHandle;
use crate::Fabric;

/// Outbound frame queue depth per session.
const OUTBOUND_BUFFER: usize = 64;

/// WebSocket GET /ws/node — persistent probe-node sessions.
pub async fn ws_node_handler(
    ws: WebSocketUpgrade,
    State(fabric): State<Arc<Fabric>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_node_socket(socket, fabric))
}

async fn handle_node_socket(mut socket: WebSocket, fabric: Arc<Fabric>) {
    // --- Handshake: the first frame must authenticate, within budget. ---
    let auth_timeout = Duration::from_secs(fabric.cfg.auth_timeout_secs);
    let auth = match tokio::time::timeout(auth_timeout, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AuthFrame>(&text) {
            Ok(auth) => auth,
            Err(_) => {
                reject(
                    socket,
                    AuthErrorFrame::new(
                        "Invalid authentication format",
                        "Expected node_uuid and api_key",
                    ),
                )
                .await;
                return;
            }
        },
        Ok(_) => {
            debug!("node connection closed before authenticating");
            return;
        }
        Err(_) => {
            reject(
                socket,
                AuthErrorFrame::new("Authentication timed out", "No auth frame within budget"),
            )
            .await;
            return;
        }
    };

    let node = match fabric.registry.authenticate(auth.node_uuid, &auth.api_key) {
        Ok(node) => node,
        Err(e) => {
            warn!(node_uuid = %auth.node_uuid, error = %e, "node session auth failed");
            reject(
                socket,
                AuthErrorFrame::new("Authentication failed", "Invalid node_uuid or api_key"),
            )
            .await;
            return;
        }
    };

    // --- Bind: at most one live session per node. The losing connection is
    // closed; the existing session and the node record stay untouched. ---
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let session = SessionHandle::new(node.node_uuid, outbound_tx);
    if fabric.sessions.bind(session.clone()).is_err() {
        info!(node_uuid = %node.node_uuid, "rejecting duplicate node session");
        reject(
            socket,
            AuthErrorFrame::new(
                "Node already connected",
                "Only one active session per node is allowed",
            ),
        )
        .await;
        return;
    }

    let node = match fabric
        .registry
        .mark_connected(
            node.node_uuid,
            session.connection_id,
            auth.version.clone(),
            auth.hostname.clone(),
        )
        .await
    {
        Ok(node) => node,
        Err(e) => {
            warn!(node_uuid = %node.node_uuid, error = %e, "failed to record session bind");
            fabric
                .sessions
                .unbind(session.node_uuid, session.connection_id);
            return;
        }
    };

    let welcome = WelcomeFrame::new(
        &node.name,
        node.node_uuid,
        session.connection_id,
        ReconnectPolicy {
            min_delay: fabric.cfg.reconnect_min_delay_ms,
            max_delay: fabric.cfg.reconnect_max_delay_ms,
            jitter_factor: fabric.cfg.reconnect_jitter,
            initial_delay: fabric.cfg.reconnect_min_delay_ms,
        },
    );
    if send_json(&mut socket, &welcome).await.is_err() {
        cleanup_session(&fabric, &session).await;
        return;
    }
    info!(
        node_uuid = %node.node_uuid,
        name = %node.name,
        connection_id = %session.connection_id,
        "node session established"
    );

    // --- Frame pump. ---
    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(pump_outbound(ws_tx, outbound_rx));

    loop {
        tokio::select! {
            // Liveness patrol (or an admin) asked us to close.
            _ = session.closed() => {
                debug!(node_uuid = %session.node_uuid, "session close requested");
                break;
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        session.touch_rx();
                        handle_frame(&fabric, &session, &text).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        session.touch_rx();
                    }
                    Some(Ok(Message::Binary(_))) => {
                        session.touch_rx();
                        debug!(node_uuid = %session.node_uuid, "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(node_uuid = %session.node_uuid, "node closed the session");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(node_uuid = %session.node_uuid, error = %e, "session read error");
                        break;
                    }
                }
            }
        }
    }

    writer.abort();
    cleanup_session(&fabric, &session).await;
}

/// Dispatch one inbound frame. Unknown or malformed frames are logged and
/// ignored; they never terminate the session.
async fn handle_frame(fabric: &Arc<Fabric>, session: &Arc<SessionHandle>, text: &str) {
    match serde_json::from_str::<NodeFrame>(text) {
        Ok(NodeFrame::Heartbeat(hb)) => {
            if let Err(e) = fabric
                .registry
                .session_heartbeat(session.node_uuid, hb.current_load, hb.error_count, hb.version)
                .await
            {
                warn!(node_uuid = %session.node_uuid, error = %e, "failed to apply heartbeat");
            }
            if session.send(ServerFrame::heartbeat_ack()).await.is_err() {
                debug!(node_uuid = %session.node_uuid, "heartbeat ack dropped, session closing");
            }
        }
        Ok(NodeFrame::DiagnosticResponse(response)) => {
            let request_id = response.request_id;
            if !session.complete_job(request_id, response) {
                // Late or duplicate result for a finished job.
                debug!(
                    node_uuid = %session.node_uuid,
                    request_id = %request_id,
                    "discarding response with no pending job"
                );
            }
            // Always re-acknowledge so a retransmitting node settles down.
            if session
                .send(ServerFrame::result_received(request_id))
                .await
                .is_err()
            {
                debug!(node_uuid = %session.node_uuid, "result ack dropped, session closing");
            }
        }
        Err(_) => {
            let frame_type = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str().map(String::from)));
            debug!(
                node_uuid = %session.node_uuid,
                frame_type = frame_type.as_deref().unwrap_or("<none>"),
                "ignoring unknown frame"
            );
        }
    }
}

/// Serialize outbound frames onto the socket until either side goes away.
async fn pump_outbound(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<ServerFrame>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound frame");
                continue;
            }
        };
        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}

/// Shared close path: detach from the live map, downgrade the node record,
/// and resolve every pending job as disconnected.
async fn cleanup_session(fabric: &Arc<Fabric>, session: &Arc<SessionHandle>) {
    session.request_close();
    fabric
        .sessions
        .unbind(session.node_uuid, session.connection_id);
    session.fail_all_pending();
    if let Err(e) = fabric
        .registry
        .mark_disconnected(session.node_uuid, session.connection_id)
        .await
    {
        // Cleanup failures are logged, never propagated.
        warn!(node_uuid = %session.node_uuid, error = %e, "failed to record disconnect");
    }
    info!(
        node_uuid = %session.node_uuid,
        connection_id = %session.connection_id,
        "node session closed"
    );
}

/// Send an auth error and close without touching any node state.
async fn reject(mut socket: WebSocket, error: AuthErrorFrame) {
    let _ = send_json(&mut socket, &error).await;
    let _ = socket.close().await;
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    let json = serde_json::to_string(value).unwrap_or_default();
    socket.send(Message::Text(json.into())).await
}
