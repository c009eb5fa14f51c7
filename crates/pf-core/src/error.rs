//! Unified error enum for the control plane core.
//!
//! Every layer (admission, fabric, HTTP surface) speaks this enum; the
//! daemon maps it onto HTTP status codes at the edge.

use std::fmt;

use thiserror::Error;

// ---------------------------------------------------------------------------
// RateLimitKind
// ---------------------------------------------------------------------------

/// Which admission gate produced a `RateLimited` denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    /// The per-minute window counter was at its cap.
    PerMinute,
    /// The per-hour window counter was at its cap.
    PerHour,
    /// The wait queue was at capacity.
    QueueFull,
    /// The request was queued but its wait budget elapsed.
    WaitTimeout,
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKind::PerMinute => write!(f, "per-minute rate limit exceeded"),
            RateLimitKind::PerHour => write!(f, "per-hour rate limit exceeded"),
            RateLimitKind::QueueFull => write!(f, "admission queue is full"),
            RateLimitKind::WaitTimeout => write!(f, "timed out waiting for admission"),
        }
    }
}

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// Errors produced by the admission engine, node fabric, and state store.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Credentials were presented but do not check out.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The principal's tier does not grant the requested feature.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// An admission gate denied the request; retry after `retry_after_secs`.
    #[error("{kind} (retry after {retry_after_secs}s)")]
    RateLimited {
        kind: RateLimitKind,
        retry_after_secs: u64,
    },

    /// The request shape or a parameter is out of range.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate session binding or unique-constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No registered node matches the dispatch filters.
    #[error("no probe node available for this job")]
    NoNodeAvailable,

    /// The job deadline expired with no response from the node.
    #[error("job timed out before the node responded")]
    JobTimeout,

    /// The node's session was lost while the job was pending.
    #[error("node disconnected while the job was pending")]
    NodeDisconnected,

    /// The caller cancelled the job before it resolved.
    #[error("job cancelled")]
    Cancelled,

    /// Durable state I/O failed.
    #[error("storage error: {0}")]
    Storage(#[from] tokio_rusqlite::Error),

    /// Anything else; surfaced as an opaque 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a `RateLimited` denial with the given retry hint.
    pub fn rate_limited(kind: RateLimitKind, retry_after_secs: u64) -> Self {
        CoreError::RateLimited {
            kind,
            retry_after_secs,
        }
    }

    /// Returns `true` when the error is retryable from the client's side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::RateLimited { .. }
                | CoreError::NoNodeAvailable
                | CoreError::JobTimeout
                | CoreError::NodeDisconnected
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
