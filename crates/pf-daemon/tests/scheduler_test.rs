use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pf_admission::{AdmissionEngine, MemoryUsageRecorder};
use pf_core::config::{AdmissionConfig, FabricConfig};
use pf_core::error::CoreError;
use pf_core::store::StateDb;
use pf_core::types::{Principal, PrincipalId, ProbeTool, TierLimits};
use pf_daemon::scheduler::{ProbeScheduler, RECOGNIZED_INTERVALS};
use pf_fabric::protocol::ServerFrame;
use pf_fabric::registry::{NodeRegistry, RegisterAttrs};
use pf_fabric::session::SessionHandle;
use pf_fabric::Fabric;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn tier(
    name: &str,
    scheduled: bool,
    intervals: &[u32],
    custom: bool,
    priority: i32,
) -> Arc<TierLimits> {
    Arc::new(TierLimits {
        name: name.to_string(),
        rate_per_minute: 100,
        rate_per_hour: 1000,
        rate_per_day: 10_000,
        rate_per_month: 100_000,
        max_concurrent: 5,
        priority,
        allowed_probe_intervals: intervals.iter().copied().collect::<BTreeSet<u32>>(),
        allow_scheduled_probes: scheduled,
        allow_api_access: true,
        allow_export: false,
        allow_alerts: false,
        allow_custom_intervals: custom,
    })
}

fn principal(user: i64, tier: Arc<TierLimits>) -> Principal {
    Principal {
        id: PrincipalId::User(user),
        tier,
        api_key_id: None,
    }
}

async fn harness() -> (Arc<ProbeScheduler>, Arc<Fabric>, Arc<MemoryUsageRecorder>) {
    let db = Arc::new(StateDb::new_in_memory().await.expect("db"));
    let registry = NodeRegistry::load(db).await.expect("registry");
    let fabric = Fabric::new(registry, FabricConfig::default());
    let usage = Arc::new(MemoryUsageRecorder::new());
    let engine = AdmissionEngine::new(AdmissionConfig::default(), usage.clone());
    let scheduler = ProbeScheduler::new(engine, fabric.dispatcher.clone());
    (scheduler, fabric, usage)
}

/// Attach a simulated node that answers every diagnostic job.
async fn attach_echo_node(fabric: &Arc<Fabric>) {
    let token = fabric
        .registry
        .create_token("t".to_string(), 24, None, None)
        .await
        .unwrap();
    let node = fabric
        .registry
        .register(
            &token.token,
            RegisterAttrs {
                name: "edge-1".to_string(),
                hostname: None,
                region: "us-east".to_string(),
                zone: None,
                internal_ip: None,
                external_ip: None,
                version: None,
                supported_tools: None,
            },
        )
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let session = SessionHandle::new(node.node_uuid, tx);
    fabric.sessions.bind(session.clone()).unwrap();
    fabric
        .registry
        .mark_connected(node.node_uuid, session.connection_id, None, None)
        .await
        .unwrap();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let ServerFrame::DiagnosticJob(job) = frame {
                session.complete_job(
                    job.request_id,
                    pf_fabric::protocol::ResponseFrame {
                        request_id: job.request_id,
                        result: serde_json::json!({"output": "pong"}),
                        success: true,
                        execution_time: 0.01,
                        timestamp: None,
                    },
                );
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Interval policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unrecognized_interval_is_invalid() {
    let (scheduler, _fabric, _usage) = harness().await;
    let p = principal(1, tier("standard", true, &RECOGNIZED_INTERVALS, false, 5));

    for interval in [0, 7, 30, 720] {
        let err = scheduler
            .add(
                "latency watch".to_string(),
                ProbeTool::Ping,
                "example.net".to_string(),
                serde_json::json!({}),
                interval,
                &p,
            )
            .expect_err("unrecognized interval");
        assert!(matches!(err, CoreError::Invalid(_)), "{interval}");
    }
}

#[tokio::test]
async fn tier_without_scheduled_probes_is_forbidden() {
    let (scheduler, _fabric, _usage) = harness().await;
    let p = principal(1, tier("free", false, &[], false, 0));

    let err = scheduler
        .add(
            "latency watch".to_string(),
            ProbeTool::Ping,
            "example.net".to_string(),
            serde_json::json!({}),
            5,
            &p,
        )
        .expect_err("tier gate");
    assert!(matches!(err, CoreError::Forbidden(_)));
}

#[tokio::test]
async fn interval_outside_tier_set_needs_custom_flag() {
    let (scheduler, _fabric, _usage) = harness().await;

    // Allowed set only has the daily interval; no custom flag.
    let restricted = principal(1, tier("restricted", true, &[1440], false, 5));
    let err = scheduler
        .add(
            "latency watch".to_string(),
            ProbeTool::Ping,
            "example.net".to_string(),
            serde_json::json!({}),
            5,
            &restricted,
        )
        .expect_err("interval not in tier set");
    assert!(matches!(err, CoreError::Forbidden(_)));

    // Same set, but the custom-intervals flag opens the recognized set.
    let custom = principal(2, tier("custom", true, &[1440], true, 10));
    let probe = scheduler
        .add(
            "latency watch".to_string(),
            ProbeTool::Ping,
            "example.net".to_string(),
            serde_json::json!({}),
            5,
            &custom,
        )
        .expect("custom intervals allowed");
    assert_eq!(probe.interval_minutes, 5);
    assert!(probe.is_active);
}

// ---------------------------------------------------------------------------
// Dispatch through admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn due_probe_dispatches_and_accounts_usage() {
    let (scheduler, fabric, usage) = harness().await;
    attach_echo_node(&fabric).await;

    let p = principal(1, tier("standard", true, &RECOGNIZED_INTERVALS, false, 5));
    let probe = scheduler
        .add(
            "latency watch".to_string(),
            ProbeTool::Ping,
            "example.net".to_string(),
            serde_json::json!({"count": 1}),
            5,
            &p,
        )
        .expect("probe added");

    // Nothing due yet: the first run is one interval out.
    assert_eq!(scheduler.tick(), 0);

    scheduler.trigger_now(probe.id).expect("force due");
    assert_eq!(scheduler.tick(), 1);

    // The dispatch runs as a background task; wait for it to settle.
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let probes = scheduler.list(p.id);
            if probes[0].last_success.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("probe completed");

    let probes = scheduler.list(p.id);
    let current = &probes[0];
    assert_eq!(current.last_success, Some(true));
    assert!(current.last_run.is_some());
    assert!(current.next_run > current.last_run.unwrap());

    // The run went through the admission engine: one usage log, endpoint
    // attributed to the scheduler.
    let logs = usage.snapshot();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].endpoint.starts_with("/scheduler/"));
    assert!(logs[0].success);
}

#[tokio::test]
async fn inactive_probe_does_not_fire() {
    let (scheduler, fabric, usage) = harness().await;
    attach_echo_node(&fabric).await;

    let p = principal(1, tier("standard", true, &RECOGNIZED_INTERVALS, false, 5));
    let probe = scheduler
        .add(
            "latency watch".to_string(),
            ProbeTool::Ping,
            "example.net".to_string(),
            serde_json::json!({}),
            5,
            &p,
        )
        .unwrap();

    scheduler.set_active(probe.id, false).expect("pause");
    scheduler.trigger_now(probe.id).expect("force due");
    assert_eq!(scheduler.tick(), 0);
    assert!(usage.is_empty());

    assert!(scheduler.remove(probe.id));
    assert!(!scheduler.remove(probe.id));
}
