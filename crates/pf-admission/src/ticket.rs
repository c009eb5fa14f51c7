use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use pf_core::types::Principal;

use crate::engine::AdmissionEngine;

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

/// One admitted request's hold on rate and concurrency budget.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub request_id: Uuid,
    pub principal: Principal,
    pub endpoint: String,
    pub client_addr: String,
    /// When the ticket started holding its concurrency slot.
    pub start: Instant,
    pub was_queued: bool,
    pub queue_wait: Duration,
}

// ---------------------------------------------------------------------------
// TicketGuard
// ---------------------------------------------------------------------------

/// Scoped holder of an admitted [`Ticket`].
///
/// The guard releases the ticket on every exit path: call
/// [`TicketGuard::complete`] with the handler outcome, or let the guard drop
/// (an error/panic path), which releases with `success = false`. Either way
/// the concurrency slot is returned and exactly one usage log is written.
pub struct TicketGuard {
    engine: Arc<AdmissionEngine>,
    ticket: Option<Ticket>,
}

impl std::fmt::Debug for TicketGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketGuard")
            .field("ticket", &self.ticket)
            .finish()
    }
}

impl TicketGuard {
    pub(crate) fn new(engine: Arc<AdmissionEngine>, ticket: Ticket) -> Self {
        Self {
            engine,
            ticket: Some(ticket),
        }
    }

    pub fn ticket(&self) -> &Ticket {
        self.ticket
            .as_ref()
            .expect("ticket present until guard is consumed")
    }

    pub fn request_id(&self) -> Uuid {
        self.ticket().request_id
    }

    pub fn was_queued(&self) -> bool {
        self.ticket().was_queued
    }

    pub fn queue_wait(&self) -> Duration {
        self.ticket().queue_wait
    }

    /// Release the ticket with the handler's outcome.
    pub fn complete(mut self, success: bool) {
        if let Some(ticket) = self.ticket.take() {
            self.engine.release(ticket, success);
        }
    }
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.engine.release(ticket, false);
        }
    }
}
