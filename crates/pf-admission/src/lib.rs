//! Tiered admission engine for probefleet.
//!
//! Every client request passes through [`engine::AdmissionEngine`] before it
//! may consume a probe node:
//! - a sliding-window rate gate (per-minute and per-hour, per principal)
//! - a per-principal concurrency gate
//! - a bounded, priority-ordered wait queue for blocked requests
//! - usage accounting emitted exactly once per admitted request
//!
//! Counters and the queue are in-process and volatile; a restart starts
//! with fresh windows, which is intentional.

pub mod account;
pub mod engine;
pub mod queue;
pub mod ticket;
pub mod usage;

pub use engine::{AdmissionEngine, RequestMeta};
pub use ticket::{Ticket, TicketGuard};
pub use usage::{MemoryUsageRecorder, UsageRecorder};
