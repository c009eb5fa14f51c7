use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pf_core::config::AdmissionConfig;
use pf_core::error::{CoreError, RateLimitKind};
use pf_core::types::{Principal, PrincipalId, UsageLog};

use crate::account::PrincipalAccount;
use crate::queue::{QueueEntry, WaitQueue, WakeGrant};
use crate::ticket::{Ticket, TicketGuard};
use crate::usage::UsageRecorder;

/// How often a repeated denial for the same engine is worth a `warn`.
const DENIAL_LOG_SAMPLE: u64 = 100;

// ---------------------------------------------------------------------------
// RequestMeta
// ---------------------------------------------------------------------------

/// Request attributes carried into the ticket for usage accounting.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub endpoint: String,
    pub client_addr: String,
}

// ---------------------------------------------------------------------------
// AdmissionEngine
// ---------------------------------------------------------------------------

/// The tiered admission engine.
///
/// `admit` either returns a [`TicketGuard`] (immediately or after a bounded
/// queue wait) or a retryable denial. Every admitted ticket releases its
/// concurrency slot and writes exactly one usage log, on every exit path.
pub struct AdmissionEngine {
    accounts: DashMap<PrincipalId, Mutex<PrincipalAccount>>,
    queue: WaitQueue,
    usage: Arc<dyn UsageRecorder>,
    cfg: AdmissionConfig,
    denials: AtomicU64,
}

impl AdmissionEngine {
    pub fn new(cfg: AdmissionConfig, usage: Arc<dyn UsageRecorder>) -> Arc<Self> {
        Arc::new(Self {
            accounts: DashMap::new(),
            queue: WaitQueue::new(cfg.max_queue),
            usage,
            cfg,
            denials: AtomicU64::new(0),
        })
    }

    fn minute_window(&self) -> Duration {
        Duration::from_secs(self.cfg.minute_window_secs)
    }

    fn hour_window(&self) -> Duration {
        Duration::from_secs(self.cfg.hour_window_secs)
    }

    fn queue_wait(&self) -> Duration {
        Duration::from_secs(self.cfg.queue_wait_secs)
    }

    // -----------------------------------------------------------------------
    // admit
    // -----------------------------------------------------------------------

    /// Admit a request for `principal`, queuing it when the principal's
    /// concurrency cap is reached.
    pub async fn admit(
        self: &Arc<Self>,
        principal: &Principal,
        meta: RequestMeta,
    ) -> Result<TicketGuard, CoreError> {
        let request_id = Uuid::new_v4();
        let tier = principal.tier.clone();
        let now = Instant::now();

        let needs_queue = {
            let account_ref = self.accounts.entry(principal.id).or_insert_with(|| {
                Mutex::new(PrincipalAccount::new(self.minute_window(), self.hour_window()))
            });
            let mut account = account_ref.lock().expect("account lock poisoned");

            account.minute.roll(now, self.minute_window());
            account.hour.roll(now, self.hour_window());

            if account.minute.at_cap(tier.rate_per_minute) {
                let retry = account.minute.secs_until_reset(now);
                self.log_denial(principal.id, RateLimitKind::PerMinute);
                return Err(CoreError::rate_limited(RateLimitKind::PerMinute, retry));
            }
            if account.hour.at_cap(tier.rate_per_hour) {
                let retry = account.hour.secs_until_reset(now);
                self.log_denial(principal.id, RateLimitKind::PerHour);
                return Err(CoreError::rate_limited(RateLimitKind::PerHour, retry));
            }

            // The request is now being considered: both counters are
            // consumed even if the concurrency gate denies it below.
            account.minute.increment();
            account.hour.increment();
            account.last_touch = now;

            if (account.active.len() as u32) < tier.max_concurrent {
                account.active.insert(request_id);
                false
            } else {
                true
            }
        };

        if !needs_queue {
            debug!(principal = %principal.id, request_id = %request_id, "admitted immediately");
            return Ok(self.ticket(principal, meta, request_id, false, Duration::ZERO));
        }

        let (tx, mut rx) = oneshot::channel();
        if self
            .queue
            .push(principal.clone(), request_id, tier.priority, tx)
            .is_err()
        {
            self.log_denial(principal.id, RateLimitKind::QueueFull);
            return Err(CoreError::rate_limited(RateLimitKind::QueueFull, 30));
        }
        debug!(
            principal = %principal.id,
            request_id = %request_id,
            queue_len = self.queue.len(),
            "admission parked"
        );

        // A slot may have opened between the gate check and the park.
        self.sweep_queue();

        let grant = match tokio::time::timeout(self.queue_wait(), &mut rx).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(_)) => {
                // The entry was purged without a grant.
                self.log_denial(principal.id, RateLimitKind::WaitTimeout);
                return Err(CoreError::rate_limited(RateLimitKind::WaitTimeout, 1));
            }
            Err(_elapsed) => {
                if self.queue.remove(request_id) {
                    self.log_denial(principal.id, RateLimitKind::WaitTimeout);
                    return Err(CoreError::rate_limited(RateLimitKind::WaitTimeout, 1));
                }
                // The sweeper claimed this entry as the budget elapsed; the
                // grant is already in flight, take it.
                match rx.await {
                    Ok(grant) => grant,
                    Err(_) => {
                        self.log_denial(principal.id, RateLimitKind::WaitTimeout);
                        return Err(CoreError::rate_limited(RateLimitKind::WaitTimeout, 1));
                    }
                }
            }
        };

        info!(
            principal = %principal.id,
            request_id = %request_id,
            queue_wait_ms = grant.queue_wait.as_millis() as u64,
            "admitted after queue wait"
        );
        Ok(self.ticket(principal, meta, request_id, true, grant.queue_wait))
    }

    fn ticket(
        self: &Arc<Self>,
        principal: &Principal,
        meta: RequestMeta,
        request_id: Uuid,
        was_queued: bool,
        queue_wait: Duration,
    ) -> TicketGuard {
        TicketGuard::new(
            self.clone(),
            Ticket {
                request_id,
                principal: principal.clone(),
                endpoint: meta.endpoint,
                client_addr: meta.client_addr,
                start: Instant::now(),
                was_queued,
                queue_wait,
            },
        )
    }

    // -----------------------------------------------------------------------
    // release
    // -----------------------------------------------------------------------

    /// Return a ticket's concurrency slot, write its usage log, and wake the
    /// queue. A second release of the same ticket is a no-op.
    pub fn release(&self, ticket: Ticket, success: bool) {
        let removed = match self.accounts.get(&ticket.principal.id) {
            Some(account) => {
                let mut account = account.lock().expect("account lock poisoned");
                account.active.remove(&ticket.request_id)
            }
            None => false,
        };
        if !removed {
            debug!(request_id = %ticket.request_id, "duplicate release ignored");
            return;
        }

        self.usage.record(UsageLog {
            principal: ticket.principal.id,
            endpoint: ticket.endpoint,
            timestamp: Utc::now(),
            success,
            response_time: ticket.start.elapsed().as_secs_f64(),
            client_addr: ticket.client_addr,
            tier: ticket.principal.tier.name.clone(),
            api_key_id: ticket.principal.api_key_id,
            was_queued: ticket.was_queued,
            queue_wait: ticket.queue_wait.as_secs_f64(),
        });

        // The slot removal above happens-before this wakeup; a woken waiter
        // observes the decremented active set.
        self.sweep_queue();
    }

    // -----------------------------------------------------------------------
    // Queue wakeup
    // -----------------------------------------------------------------------

    /// Re-examine the queue in priority order, admitting every parked entry
    /// whose principal has concurrency capacity. Saturated principals are
    /// skipped; a lower-priority entry for a different principal may be
    /// admitted ahead of them.
    pub fn sweep_queue(&self) {
        loop {
            let granted = self.queue.take_grantable(|entry| self.try_claim(entry));
            if granted.is_empty() {
                return;
            }
            let mut reclaimed = false;
            for entry in granted {
                let queue_wait = entry.enqueued_at.elapsed();
                let principal = entry.principal.id;
                let request_id = entry.request_id;
                if entry.waiter.send(WakeGrant { queue_wait }).is_err() {
                    // The waiter vanished between claim and send; return the
                    // slot and rescan, it may admit someone else.
                    self.unclaim(principal, request_id);
                    reclaimed = true;
                }
            }
            if !reclaimed {
                return;
            }
        }
    }

    fn try_claim(&self, entry: &QueueEntry) -> bool {
        let account_ref = self.accounts.entry(entry.principal.id).or_insert_with(|| {
            Mutex::new(PrincipalAccount::new(self.minute_window(), self.hour_window()))
        });
        let mut account = account_ref.lock().expect("account lock poisoned");
        if (account.active.len() as u32) < entry.principal.tier.max_concurrent {
            account.active.insert(entry.request_id);
            account.last_touch = Instant::now();
            true
        } else {
            false
        }
    }

    fn unclaim(&self, principal: PrincipalId, request_id: Uuid) {
        if let Some(account) = self.accounts.get(&principal) {
            let mut account = account.lock().expect("account lock poisoned");
            account.active.remove(&request_id);
        }
    }

    // -----------------------------------------------------------------------
    // Periodic sweep
    // -----------------------------------------------------------------------

    /// Periodic maintenance: wake the queue, drop stale entries, and collect
    /// idle accounts. The daemon runs this every few seconds.
    pub fn sweep(&self) {
        self.sweep_queue();

        let dropped = self.queue.purge_older_than(self.queue_wait());
        if dropped > 0 {
            warn!(dropped, "dropped queue entries past their wait budget");
        }

        let now = Instant::now();
        self.accounts.retain(|_, account| {
            let account = account.get_mut().expect("account lock poisoned");
            !account.is_collectable(now)
        });
    }

    // -----------------------------------------------------------------------
    // Introspection (tests and ops)
    // -----------------------------------------------------------------------

    /// Number of requests currently holding a slot for `principal`.
    pub fn active_count(&self, principal: PrincipalId) -> usize {
        self.accounts
            .get(&principal)
            .map(|a| a.lock().expect("account lock poisoned").active.len())
            .unwrap_or(0)
    }

    /// Number of parked admissions.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of tracked principal accounts.
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    fn log_denial(&self, principal: PrincipalId, kind: RateLimitKind) {
        let n = self.denials.fetch_add(1, AtomicOrdering::Relaxed);
        if n % DENIAL_LOG_SAMPLE == 0 {
            warn!(principal = %principal, %kind, total_denials = n + 1, "admission denied");
        } else {
            debug!(principal = %principal, %kind, "admission denied");
        }
    }
}
