//! Recurring probes.
//!
//! Scheduled probes funnel through the same admission engine and dispatcher
//! as ad-hoc requests; the scheduler holds no special capacity. Intervals
//! come from a recognized set and are gated by the owning tier.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pf_admission::{AdmissionEngine, RequestMeta};
use pf_core::error::CoreError;
use pf_core::types::{Principal, PrincipalId, ProbeTool};
use pf_fabric::dispatcher::{Dispatcher, ProbeSpec};

/// Intervals (minutes) the scheduler understands at all.
pub const RECOGNIZED_INTERVALS: [u32; 4] = [5, 15, 60, 1440];

// ---------------------------------------------------------------------------
// ScheduledProbe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScheduledProbe {
    pub id: Uuid,
    pub name: String,
    pub tool: ProbeTool,
    pub target: String,
    pub parameters: serde_json::Value,
    pub interval_minutes: u32,
    /// Owning principal; dispatches run at this tier's priority.
    pub principal: Principal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub last_success: Option<bool>,
}

// ---------------------------------------------------------------------------
// ProbeScheduler
// ---------------------------------------------------------------------------

pub struct ProbeScheduler {
    probes: DashMap<Uuid, ScheduledProbe>,
    engine: Arc<AdmissionEngine>,
    dispatcher: Dispatcher,
}

impl ProbeScheduler {
    pub fn new(engine: Arc<AdmissionEngine>, dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            probes: DashMap::new(),
            engine,
            dispatcher,
        })
    }

    /// Register a recurring probe for `principal`.
    ///
    /// The interval must be recognized, and either listed in the tier's
    /// allowed intervals or covered by its custom-intervals flag.
    pub fn add(
        &self,
        name: String,
        tool: ProbeTool,
        target: String,
        parameters: serde_json::Value,
        interval_minutes: u32,
        principal: &Principal,
    ) -> Result<ScheduledProbe, CoreError> {
        if !RECOGNIZED_INTERVALS.contains(&interval_minutes) {
            return Err(CoreError::Invalid(format!(
                "invalid interval {} — recognized intervals are {:?} minutes",
                interval_minutes, RECOGNIZED_INTERVALS
            )));
        }
        let tier = &principal.tier;
        if !tier.allow_scheduled_probes {
            return Err(CoreError::Forbidden(
                "tier does not allow scheduled probes".into(),
            ));
        }
        if !tier.allowed_probe_intervals.contains(&interval_minutes)
            && !tier.allow_custom_intervals
        {
            return Err(CoreError::Forbidden(format!(
                "interval {} minutes is not available on the {} tier",
                interval_minutes, tier.name
            )));
        }

        let now = Utc::now();
        let probe = ScheduledProbe {
            id: Uuid::new_v4(),
            name,
            tool,
            target,
            parameters,
            interval_minutes,
            principal: principal.clone(),
            is_active: true,
            created_at: now,
            last_run: None,
            next_run: now + ChronoDuration::minutes(i64::from(interval_minutes)),
            last_success: None,
        };
        info!(
            probe_id = %probe.id,
            tool = %probe.tool,
            interval_minutes,
            principal = %principal.id,
            "scheduled probe created"
        );
        self.probes.insert(probe.id, probe.clone());
        Ok(probe)
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.probes.remove(&id).is_some()
    }

    pub fn set_active(&self, id: Uuid, active: bool) -> Result<(), CoreError> {
        let mut probe = self
            .probes
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound("scheduled probe not found".into()))?;
        probe.is_active = active;
        Ok(())
    }

    /// Make a probe due immediately; it fires on the next tick.
    pub fn trigger_now(&self, id: Uuid) -> Result<(), CoreError> {
        let mut probe = self
            .probes
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound("scheduled probe not found".into()))?;
        probe.next_run = Utc::now();
        Ok(())
    }

    pub fn list(&self, owner: PrincipalId) -> Vec<ScheduledProbe> {
        let mut probes: Vec<ScheduledProbe> = self
            .probes
            .iter()
            .filter(|p| p.principal.id == owner)
            .map(|p| p.clone())
            .collect();
        probes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        probes
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Fire every due probe. Each dispatch runs as its own task so one slow
    /// probe cannot starve the tick; all of them pass through admission.
    pub fn tick(self: &Arc<Self>) -> usize {
        let now = Utc::now();
        let due: Vec<ScheduledProbe> = self
            .probes
            .iter()
            .filter(|p| p.is_active && p.next_run <= now)
            .map(|p| p.clone())
            .collect();

        for probe in &due {
            // Reschedule before running so a failing probe cannot tight-loop.
            if let Some(mut entry) = self.probes.get_mut(&probe.id) {
                entry.last_run = Some(now);
                entry.next_run = now + ChronoDuration::minutes(i64::from(probe.interval_minutes));
            }

            let scheduler = self.clone();
            let probe = probe.clone();
            tokio::spawn(async move {
                scheduler.run_due_probe(probe).await;
            });
        }

        due.len()
    }

    async fn run_due_probe(self: Arc<Self>, probe: ScheduledProbe) {
        let meta = RequestMeta {
            endpoint: format!("/scheduler/{}", probe.tool),
            client_addr: "scheduler".to_string(),
        };

        let guard = match self.engine.admit(&probe.principal, meta).await {
            Ok(guard) => guard,
            Err(e) => {
                // Denials are expected under pressure; try again next tick.
                debug!(probe_id = %probe.id, error = %e, "scheduled probe not admitted");
                return;
            }
        };

        let spec = ProbeSpec {
            tool: probe.tool,
            target: probe.target.clone(),
            parameters: probe.parameters.clone(),
            priority: probe.principal.tier.priority,
            region: None,
            timeout: None,
        };
        let outcome = self.dispatcher.dispatch(spec).await;

        let success = match &outcome {
            Ok(report) => report.success,
            Err(_) => false,
        };
        guard.complete(success);

        if let Some(mut entry) = self.probes.get_mut(&probe.id) {
            entry.last_success = Some(success);
        }
        match outcome {
            Ok(report) => {
                debug!(
                    probe_id = %probe.id,
                    request_id = %report.request_id,
                    success = report.success,
                    "scheduled probe completed"
                );
            }
            Err(e) => {
                warn!(probe_id = %probe.id, error = %e, "scheduled probe failed");
            }
        }
    }
}
