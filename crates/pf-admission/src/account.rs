use std::collections::HashSet;
use std::time::{Duration, Instant};

use uuid::Uuid;

// ---------------------------------------------------------------------------
// WindowCounter
// ---------------------------------------------------------------------------

/// One sliding-window counter: a count and the instant its window closes.
///
/// Crossing `window_end` zeroes the count before the next increment, so the
/// window end always strictly exceeds every increment it counted.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    count: u32,
    window_end: Instant,
}

impl WindowCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            count: 0,
            window_end: Instant::now() + window,
        }
    }

    /// Reset the counter if its window has lapsed.
    pub fn roll(&mut self, now: Instant, window: Duration) {
        if now >= self.window_end {
            self.count = 0;
            self.window_end = now + window;
        }
    }

    pub fn at_cap(&self, cap: u32) -> bool {
        self.count >= cap
    }

    pub fn increment(&mut self) {
        self.count += 1;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Seconds until the window closes (retry guidance for denials).
    pub fn secs_until_reset(&self, now: Instant) -> u64 {
        self.window_end.saturating_duration_since(now).as_secs().max(1)
    }

    /// True when the counter holds no live budget consumption.
    pub fn is_lapsed_or_zero(&self, now: Instant) -> bool {
        self.count == 0 || now >= self.window_end
    }
}

// ---------------------------------------------------------------------------
// PrincipalAccount
// ---------------------------------------------------------------------------

/// Running admission state for one principal.
///
/// Guarded by a per-account lock; the engine never holds it across a
/// suspension point.
#[derive(Debug)]
pub struct PrincipalAccount {
    pub minute: WindowCounter,
    pub hour: WindowCounter,
    /// Request ids currently holding a concurrency slot.
    pub active: HashSet<Uuid>,
    pub last_touch: Instant,
}

impl PrincipalAccount {
    pub fn new(minute_window: Duration, hour_window: Duration) -> Self {
        Self {
            minute: WindowCounter::new(minute_window),
            hour: WindowCounter::new(hour_window),
            active: HashSet::new(),
            last_touch: Instant::now(),
        }
    }

    /// Whether the sweeper may discard this account.
    pub fn is_collectable(&self, now: Instant) -> bool {
        self.active.is_empty()
            && self.minute.is_lapsed_or_zero(now)
            && self.hour.is_lapsed_or_zero(now)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
