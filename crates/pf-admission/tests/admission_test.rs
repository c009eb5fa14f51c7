use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pf_admission::{AdmissionEngine, MemoryUsageRecorder, RequestMeta};
use pf_core::config::AdmissionConfig;
use pf_core::error::{CoreError, RateLimitKind};
use pf_core::types::{Principal, PrincipalId, TierLimits};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn tier(name: &str, rpm: u32, rph: u32, max_concurrent: u32, priority: i32) -> Arc<TierLimits> {
    Arc::new(TierLimits {
        name: name.to_string(),
        rate_per_minute: rpm,
        rate_per_hour: rph,
        rate_per_day: 10_000,
        rate_per_month: 100_000,
        max_concurrent,
        priority,
        allowed_probe_intervals: BTreeSet::new(),
        allow_scheduled_probes: false,
        allow_api_access: true,
        allow_export: false,
        allow_alerts: false,
        allow_custom_intervals: false,
    })
}

fn principal(user: i64, tier: Arc<TierLimits>) -> Principal {
    Principal {
        id: PrincipalId::User(user),
        tier,
        api_key_id: None,
    }
}

fn meta() -> RequestMeta {
    RequestMeta {
        endpoint: "/diagnostics/run".to_string(),
        client_addr: "198.51.100.7".to_string(),
    }
}

fn config(max_queue: usize, queue_wait_secs: u64, minute_window_secs: u64) -> AdmissionConfig {
    AdmissionConfig {
        max_queue,
        queue_wait_secs,
        sweep_interval_secs: 5,
        minute_window_secs,
        hour_window_secs: 3600,
    }
}

fn kind_of(err: CoreError) -> RateLimitKind {
    match err {
        CoreError::RateLimited { kind, .. } => kind,
        other => panic!("expected RateLimited, got {other}"),
    }
}

// ---------------------------------------------------------------------------
// Concurrency cap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn third_request_queues_until_a_release() {
    let usage = Arc::new(MemoryUsageRecorder::new());
    let engine = AdmissionEngine::new(config(1000, 5, 60), usage.clone());
    let p = principal(1, tier("t", 100, 1000, 2, 0));

    let a = engine.admit(&p, meta()).await.expect("A admitted");
    let b = engine.admit(&p, meta()).await.expect("B admitted");
    assert!(!a.was_queued());
    assert!(!b.was_queued());
    assert_eq!(engine.active_count(p.id), 2);

    let c_engine = engine.clone();
    let c_principal = p.clone();
    let c_task =
        tokio::spawn(async move { c_engine.admit(&c_principal, meta()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.queue_len(), 1, "C must be parked");

    a.complete(true);

    let c = tokio::time::timeout(Duration::from_secs(2), c_task)
        .await
        .expect("C woken in time")
        .expect("join")
        .expect("C admitted");
    assert!(c.was_queued());
    assert_eq!(engine.active_count(p.id), 2);

    b.complete(true);
    c.complete(true);
    assert_eq!(engine.active_count(p.id), 0);
    assert_eq!(usage.len(), 3);
}

// ---------------------------------------------------------------------------
// Rate gate and window rollover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fourth_request_in_window_is_denied_then_window_rolls() {
    let usage = Arc::new(MemoryUsageRecorder::new());
    // 1-second minute window so the test can cross a boundary for real.
    let engine = AdmissionEngine::new(config(1000, 5, 1), usage);
    let p = principal(2, tier("t", 3, 1000, 10, 0));

    for _ in 0..3 {
        let guard = engine.admit(&p, meta()).await.expect("within rate");
        guard.complete(true);
    }

    let denied = engine.admit(&p, meta()).await.expect_err("over rate");
    assert_eq!(kind_of(denied), RateLimitKind::PerMinute);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let guard = engine
        .admit(&p, meta())
        .await
        .expect("fresh window admits again");
    guard.complete(true);
}

// ---------------------------------------------------------------------------
// Priority does not jump a saturated principal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn saturated_high_priority_principal_does_not_block_others() {
    let usage = Arc::new(MemoryUsageRecorder::new());
    let engine = AdmissionEngine::new(config(1000, 10, 60), usage);
    let p_hi = principal(10, tier("hi", 100, 1000, 1, 10));
    let p_lo = principal(11, tier("lo", 100, 1000, 1, 1));

    let hi1 = engine.admit(&p_hi, meta()).await.expect("hi1");
    let lo1 = engine.admit(&p_lo, meta()).await.expect("lo1");

    let e = engine.clone();
    let p = p_hi.clone();
    let mut h2 = tokio::spawn(async move { e.admit(&p, meta()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let e = engine.clone();
    let p = p_lo.clone();
    let l2 = tokio::spawn(async move { e.admit(&p, meta()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.queue_len(), 2);

    // Releasing the low-priority slot admits L2: H2 has higher priority but
    // its principal is still at its concurrency cap.
    lo1.complete(true);

    let l2 = tokio::time::timeout(Duration::from_secs(2), l2)
        .await
        .expect("L2 woken")
        .expect("join")
        .expect("L2 admitted");
    assert!(l2.was_queued());
    assert!(
        tokio::time::timeout(Duration::from_millis(200), &mut h2)
            .await
            .is_err(),
        "H2 must still be parked while its principal is saturated"
    );

    hi1.complete(true);
    let h2 = tokio::time::timeout(Duration::from_secs(2), h2)
        .await
        .expect("H2 woken")
        .expect("join")
        .expect("H2 admitted");
    assert!(h2.was_queued());

    l2.complete(true);
    h2.complete(true);
}

// ---------------------------------------------------------------------------
// Full queue denies synchronously
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_queue_denies_new_entries() {
    let usage = Arc::new(MemoryUsageRecorder::new());
    let engine = AdmissionEngine::new(config(1, 1, 60), usage);
    let p = principal(3, tier("t", 100, 1000, 1, 0));

    let held = engine.admit(&p, meta()).await.expect("first slot");

    let e = engine.clone();
    let pq = p.clone();
    let parked = tokio::spawn(async move { e.admit(&pq, meta()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.queue_len(), 1);

    let denied = engine.admit(&p, meta()).await.expect_err("queue is full");
    assert_eq!(kind_of(denied), RateLimitKind::QueueFull);

    held.complete(true);
    let parked = parked.await.expect("join").expect("parked one admitted");
    parked.complete(true);
}

// ---------------------------------------------------------------------------
// Queue wait budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parked_admission_times_out() {
    let usage = Arc::new(MemoryUsageRecorder::new());
    let engine = AdmissionEngine::new(config(1000, 1, 60), usage.clone());
    let p = principal(4, tier("t", 100, 1000, 1, 0));

    let _held = engine.admit(&p, meta()).await.expect("first slot");

    let started = std::time::Instant::now();
    let denied = engine.admit(&p, meta()).await.expect_err("wait budget");
    assert_eq!(kind_of(denied), RateLimitKind::WaitTimeout);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(engine.queue_len(), 0, "timed-out entry must leave the queue");

    // The denial never became in-flight: no usage log for it.
    assert!(usage.is_empty());
}

// ---------------------------------------------------------------------------
// Release is idempotent; exactly one usage log
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_release_is_a_noop() {
    let usage = Arc::new(MemoryUsageRecorder::new());
    let engine = AdmissionEngine::new(config(1000, 5, 60), usage.clone());
    let p = principal(5, tier("t", 100, 1000, 2, 0));

    let guard = engine.admit(&p, meta()).await.expect("admitted");
    let ticket = guard.ticket().clone();
    guard.complete(true);

    // A second release of the same ticket must not free a slot it no longer
    // holds, and must not write a second usage log.
    engine.release(ticket.clone(), true);
    engine.release(ticket, false);

    assert_eq!(engine.active_count(p.id), 0);
    assert_eq!(usage.len(), 1, "exactly one usage log per admitted ticket");
}

#[tokio::test]
async fn dropped_guard_releases_with_failure_outcome() {
    let usage = Arc::new(MemoryUsageRecorder::new());
    let engine = AdmissionEngine::new(config(1000, 5, 60), usage.clone());
    let p = principal(6, tier("t", 100, 1000, 2, 0));

    {
        let _guard = engine.admit(&p, meta()).await.expect("admitted");
        // Dropped without complete(): an error path.
    }

    assert_eq!(engine.active_count(p.id), 0);
    let logs = usage.snapshot();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].success);
    assert_eq!(logs[0].tier, "t");
}

// ---------------------------------------------------------------------------
// Cancellation of a queued admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_queued_admission_leaves_no_trace() {
    let usage = Arc::new(MemoryUsageRecorder::new());
    let engine = AdmissionEngine::new(config(1000, 5, 60), usage.clone());
    let p = principal(7, tier("t", 100, 1000, 1, 0));

    let held = engine.admit(&p, meta()).await.expect("first slot");

    let e = engine.clone();
    let pq = p.clone();
    let parked = tokio::spawn(async move { e.admit(&pq, meta()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    parked.abort();
    let _ = parked.await;

    // The abandoned waiter must not absorb the freed slot.
    held.complete(true);
    engine.sweep();
    assert_eq!(engine.active_count(p.id), 0);
    assert_eq!(engine.queue_len(), 0);
    assert_eq!(usage.len(), 1, "only the held ticket logged usage");
}

// ---------------------------------------------------------------------------
// Account GC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweeper_collects_idle_accounts() {
    let usage = Arc::new(MemoryUsageRecorder::new());
    let engine = AdmissionEngine::new(
        AdmissionConfig {
            max_queue: 1000,
            queue_wait_secs: 5,
            sweep_interval_secs: 5,
            minute_window_secs: 1,
            hour_window_secs: 1,
        },
        usage,
    );
    let p = principal(8, tier("t", 100, 1000, 2, 0));

    let guard = engine.admit(&p, meta()).await.expect("admitted");
    guard.complete(true);
    assert_eq!(engine.account_count(), 1);

    // Counters still live: the account survives a sweep.
    engine.sweep();
    assert_eq!(engine.account_count(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    engine.sweep();
    assert_eq!(engine.account_count(), 0);
}
