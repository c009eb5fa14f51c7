use std::sync::Arc;

use pf_core::error::CoreError;
use pf_core::store::StateDb;
use pf_core::types::{NodeStatus, ProbeTool};
use pf_fabric::registry::{HeartbeatMetrics, NodeRegistry, NodeUpdate, RegisterAttrs};
use uuid::Uuid;

async fn registry() -> Arc<NodeRegistry> {
    let db = Arc::new(StateDb::new_in_memory().await.expect("in-memory db"));
    NodeRegistry::load(db).await.expect("registry loads")
}

fn attrs(name: &str, region: &str) -> RegisterAttrs {
    RegisterAttrs {
        name: name.to_string(),
        hostname: Some(format!("{}.probe.example.net", name)),
        region: region.to_string(),
        zone: None,
        internal_ip: None,
        external_ip: None,
        version: Some("1.4.2".to_string()),
        supported_tools: None,
    }
}

#[tokio::test]
async fn token_exchange_mints_node_identity() {
    let registry = registry().await;
    let token = registry
        .create_token("rack 4".to_string(), 24, Some("us-east".to_string()), Some(1))
        .await
        .expect("token");
    assert!(token.token.starts_with("pnreg_"));

    let node = registry
        .register(&token.token, attrs("edge-1", "us-east"))
        .await
        .expect("register");
    assert!(node.api_key.starts_with("pnode_"));
    assert_eq!(node.status, NodeStatus::Registered);
    assert!(node.supported_tools.contains(&ProbeTool::Ping));

    // The token is spent: a second exchange fails and mints nothing.
    let err = registry
        .register(&token.token, attrs("edge-2", "us-east"))
        .await
        .expect_err("single use");
    assert!(matches!(err, CoreError::Unauthenticated(_)));
    assert_eq!(registry.list(None, None, false).len(), 1);
}

#[tokio::test]
async fn token_expiry_bounds_are_enforced() {
    let registry = registry().await;
    for bad in [0, 169, -5] {
        let err = registry
            .create_token("bad".to_string(), bad, None, None)
            .await
            .expect_err("out of range");
        assert!(matches!(err, CoreError::Invalid(_)), "{bad}");
    }
    registry
        .create_token("edge of range".to_string(), 168, None, None)
        .await
        .expect("168h is allowed");
}

#[tokio::test]
async fn revoked_token_cannot_register() {
    let registry = registry().await;
    let token = registry
        .create_token("to revoke".to_string(), 24, None, None)
        .await
        .expect("token");
    registry.revoke_token(&token.token).await.expect("revoke");

    let err = registry
        .register(&token.token, attrs("edge-1", "us-east"))
        .await
        .expect_err("revoked");
    assert!(matches!(err, CoreError::Unauthenticated(_)));

    assert!(matches!(
        registry.revoke_token("pnreg_nonexistent").await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn authenticate_requires_exact_pair() {
    let registry = registry().await;
    let token = registry
        .create_token("t".to_string(), 24, None, None)
        .await
        .unwrap();
    let node = registry
        .register(&token.token, attrs("edge-1", "us-east"))
        .await
        .unwrap();

    assert!(registry.authenticate(node.node_uuid, &node.api_key).is_ok());
    assert!(matches!(
        registry.authenticate(node.node_uuid, "pnode_wrong"),
        Err(CoreError::Unauthenticated(_))
    ));
    assert!(matches!(
        registry.authenticate(Uuid::new_v4(), &node.api_key),
        Err(CoreError::Unauthenticated(_))
    ));
}

#[tokio::test]
async fn deactivation_is_terminal() {
    let registry = registry().await;
    let token = registry
        .create_token("t".to_string(), 24, None, None)
        .await
        .unwrap();
    let node = registry
        .register(&token.token, attrs("edge-1", "us-east"))
        .await
        .unwrap();

    registry.deactivate(node.node_uuid).await.expect("deactivate");
    assert!(matches!(
        registry.authenticate(node.node_uuid, &node.api_key),
        Err(CoreError::Unauthenticated(_))
    ));

    // A disconnect after deactivation must not resurrect the node.
    registry
        .mark_disconnected(node.node_uuid, Uuid::new_v4())
        .await
        .expect("disconnect");
    assert_eq!(
        registry.get(node.node_uuid).unwrap().status,
        NodeStatus::Deactivated
    );
}

#[tokio::test]
async fn connect_disconnect_cycle_updates_the_record() {
    let registry = registry().await;
    let token = registry
        .create_token("t".to_string(), 24, None, None)
        .await
        .unwrap();
    let node = registry
        .register(&token.token, attrs("edge-1", "us-east"))
        .await
        .unwrap();

    let conn = Uuid::new_v4();
    let bound = registry
        .mark_connected(node.node_uuid, conn, Some("1.5.0".to_string()), None)
        .await
        .expect("connect");
    assert_eq!(bound.status, NodeStatus::Active);
    assert_eq!(bound.connection_id, Some(conn));
    assert_eq!(bound.reconnect_count, 1);
    assert_eq!(bound.version.as_deref(), Some("1.5.0"));

    registry
        .mark_disconnected(node.node_uuid, conn)
        .await
        .expect("disconnect");
    let after = registry.get(node.node_uuid).unwrap();
    assert_eq!(after.status, NodeStatus::Disconnected);
    assert!(after.connection_id.is_none());

    // Reconnection binds a fresh connection id and bumps the counter.
    let conn2 = Uuid::new_v4();
    let rebound = registry
        .mark_connected(node.node_uuid, conn2, None, None)
        .await
        .expect("reconnect");
    assert_eq!(rebound.connection_id, Some(conn2));
    assert_eq!(rebound.reconnect_count, 2);
}

#[tokio::test]
async fn http_heartbeat_defers_to_live_session() {
    let registry = registry().await;
    let token = registry
        .create_token("t".to_string(), 24, None, None)
        .await
        .unwrap();
    let node = registry
        .register(&token.token, attrs("edge-1", "us-east"))
        .await
        .unwrap();

    let metrics = HeartbeatMetrics {
        current_load: 2.5, // deliberately out of range
        avg_response_time: 40.0,
        error_count: 2,
        version: Some("1.6.0".to_string()),
    };

    // No live session: metrics apply, load clamped.
    let updated = registry
        .http_heartbeat(node.node_uuid, &node.api_key, metrics.clone(), false)
        .await
        .expect("heartbeat");
    assert_eq!(updated.current_load, 1.0);
    assert_eq!(updated.error_count, 2);
    assert_eq!(updated.version.as_deref(), Some("1.6.0"));

    // Live session present: only the timestamp moves.
    let again = registry
        .http_heartbeat(
            node.node_uuid,
            &node.api_key,
            HeartbeatMetrics {
                current_load: 0.1,
                avg_response_time: 10.0,
                error_count: 5,
                version: None,
            },
            true,
        )
        .await
        .expect("heartbeat");
    assert_eq!(again.current_load, 1.0, "load untouched under live session");
    assert_eq!(again.error_count, 2, "errors untouched under live session");

    // Wrong key is rejected outright.
    assert!(matches!(
        registry
            .http_heartbeat(node.node_uuid, "pnode_bad", metrics, false)
            .await,
        Err(CoreError::Unauthenticated(_))
    ));
}

#[tokio::test]
async fn heartbeat_heals_error_status() {
    let registry = registry().await;
    let token = registry
        .create_token("t".to_string(), 24, None, None)
        .await
        .unwrap();
    let node = registry
        .register(&token.token, attrs("edge-1", "us-east"))
        .await
        .unwrap();

    // An operator flags the node as errored; the next heartbeat heals it.
    registry
        .update(
            node.node_uuid,
            NodeUpdate {
                status: Some(NodeStatus::Error),
                ..NodeUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(registry.get(node.node_uuid).unwrap().status, NodeStatus::Error);

    let healed = registry
        .http_heartbeat(
            node.node_uuid,
            &node.api_key,
            HeartbeatMetrics {
                current_load: 0.2,
                avg_response_time: 12.0,
                error_count: 0,
                version: None,
            },
            false,
        )
        .await
        .unwrap();
    assert_eq!(healed.status, NodeStatus::Active);
}

#[tokio::test]
async fn job_accounting_updates_moving_average() {
    let registry = registry().await;
    let token = registry
        .create_token("t".to_string(), 24, None, None)
        .await
        .unwrap();
    let node = registry
        .register(&token.token, attrs("edge-1", "us-east"))
        .await
        .unwrap();

    registry
        .record_job_success(node.node_uuid, 100.0)
        .await
        .unwrap();
    let after_first = registry.get(node.node_uuid).unwrap();
    assert_eq!(after_first.total_probes_executed, 1);
    assert!((after_first.avg_response_time - 100.0).abs() < f64::EPSILON);

    registry
        .record_job_success(node.node_uuid, 200.0)
        .await
        .unwrap();
    let after_second = registry.get(node.node_uuid).unwrap();
    assert_eq!(after_second.total_probes_executed, 2);
    // 0.2 * 200 + 0.8 * 100
    assert!((after_second.avg_response_time - 120.0).abs() < 1e-9);
}

#[tokio::test]
async fn list_filters_by_region_and_status() {
    let registry = registry().await;
    for (name, region) in [("edge-1", "us-east"), ("edge-2", "eu-west")] {
        let token = registry
            .create_token(name.to_string(), 24, None, None)
            .await
            .unwrap();
        registry.register(&token.token, attrs(name, region)).await.unwrap();
    }

    assert_eq!(registry.list(Some("eu-west"), None, false).len(), 1);
    assert_eq!(
        registry
            .list(None, Some(NodeStatus::Registered), false)
            .len(),
        2
    );
    assert!(registry.list(None, None, true).is_empty(), "none active yet");
}
