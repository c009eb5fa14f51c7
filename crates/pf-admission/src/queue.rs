use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use uuid::Uuid;

use pf_core::types::Principal;

// ---------------------------------------------------------------------------
// WakeGrant / QueueEntry
// ---------------------------------------------------------------------------

/// Sent to a parked waiter when the sweeper has claimed a concurrency slot
/// on its behalf.
#[derive(Debug)]
pub struct WakeGrant {
    pub queue_wait: Duration,
}

/// One parked admission, ordered by (priority desc, enqueued_at asc).
pub struct QueueEntry {
    pub principal: Principal,
    pub request_id: Uuid,
    pub priority: i32,
    pub enqueued_at: Instant,
    /// Monotonic insertion counter; breaks ties between identical instants.
    seq: u64,
    pub waiter: oneshot::Sender<WakeGrant>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority pops first, then the
        // earlier arrival, then the lower insertion sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ---------------------------------------------------------------------------
// WaitQueue
// ---------------------------------------------------------------------------

/// Process-wide bounded queue of blocked admissions.
///
/// The lock protects structural mutation only; waiters are fulfilled after
/// it is released.
pub struct WaitQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    capacity: usize,
    seq: AtomicU64,
}

/// Push rejection: the queue is at capacity.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

impl WaitQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
            seq: AtomicU64::new(0),
        }
    }

    /// Park a waiter. Fails synchronously when the queue is at capacity.
    pub fn push(
        &self,
        principal: Principal,
        request_id: Uuid,
        priority: i32,
        waiter: oneshot::Sender<WakeGrant>,
    ) -> Result<(), QueueFull> {
        let mut heap = self.heap.lock().expect("wait queue lock poisoned");
        if heap.len() >= self.capacity {
            // Abandoned waiters (cancelled callers) may be padding the
            // count; purge them before giving up.
            heap.retain(|e| !e.waiter.is_closed());
            if heap.len() >= self.capacity {
                return Err(QueueFull);
            }
        }
        heap.push(QueueEntry {
            principal,
            request_id,
            priority,
            enqueued_at: Instant::now(),
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            waiter,
        });
        Ok(())
    }

    /// Remove a parked entry. Returns `false` when the entry is no longer
    /// queued (already granted, or already purged).
    pub fn remove(&self, request_id: Uuid) -> bool {
        let mut heap = self.heap.lock().expect("wait queue lock poisoned");
        let before = heap.len();
        heap.retain(|e| e.request_id != request_id);
        heap.len() != before
    }

    /// Sweep the queue in priority order: every entry whose `claim` succeeds
    /// is removed and returned for fulfilment; saturated principals are
    /// skipped, not blocked on.
    pub fn take_grantable(
        &self,
        mut claim: impl FnMut(&QueueEntry) -> bool,
    ) -> Vec<QueueEntry> {
        let mut heap = self.heap.lock().expect("wait queue lock poisoned");
        let mut granted = Vec::new();
        let mut kept = Vec::new();

        while let Some(entry) = heap.pop() {
            if entry.waiter.is_closed() {
                // The caller gave up; drop the tombstone.
                continue;
            }
            if claim(&entry) {
                granted.push(entry);
            } else {
                kept.push(entry);
            }
        }
        for entry in kept {
            heap.push(entry);
        }
        granted
    }

    /// Drop entries older than `max_age` (defensive; the waiter's own
    /// timeout is the primary mechanism). Returns how many were dropped.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let mut heap = self.heap.lock().expect("wait queue lock poisoned");
        let before = heap.len();
        heap.retain(|e| e.enqueued_at.elapsed() < max_age);
        before - heap.len()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("wait queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pf_core::catalog::default_limits;
    use pf_core::types::PrincipalId;
    use std::sync::Arc;

    fn principal(user: i64) -> Principal {
        Principal {
            id: PrincipalId::User(user),
            tier: Arc::new(default_limits()),
            api_key_id: None,
        }
    }

    fn park(queue: &WaitQueue, user: i64, priority: i32) -> (Uuid, oneshot::Receiver<WakeGrant>) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        queue
            .push(principal(user), id, priority, tx)
            .expect("queue has room");
        (id, rx)
    }

    #[test]
    fn orders_by_priority_then_arrival() {
        let queue = WaitQueue::new(10);
        let (low_id, _rx1) = park(&queue, 1, 1);
        let (hi_id, _rx2) = park(&queue, 2, 10);
        let (hi2_id, _rx3) = park(&queue, 3, 10);

        let granted = queue.take_grantable(|_| true);
        let order: Vec<Uuid> = granted.iter().map(|e| e.request_id).collect();
        assert_eq!(order, vec![hi_id, hi2_id, low_id]);
    }

    #[test]
    fn skipped_entries_keep_their_position() {
        let queue = WaitQueue::new(10);
        let (hi_id, _rx1) = park(&queue, 1, 10);
        let (low_id, _rx2) = park(&queue, 2, 1);

        // First pass: the high-priority principal is saturated.
        let granted = queue.take_grantable(|e| e.request_id != hi_id);
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].request_id, low_id);

        // Second pass: it is admitted and was not lost.
        let granted = queue.take_grantable(|_| true);
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].request_id, hi_id);
    }

    #[test]
    fn capacity_denies_synchronously() {
        let queue = WaitQueue::new(2);
        let (_a, _rx_a) = park(&queue, 1, 0);
        let (_b, _rx_b) = park(&queue, 2, 0);

        let (tx, _rx) = oneshot::channel();
        let err = queue.push(principal(3), Uuid::new_v4(), 0, tx);
        assert_eq!(err, Err(QueueFull));
    }

    #[test]
    fn full_queue_reclaims_abandoned_waiters() {
        let queue = WaitQueue::new(1);
        let (tx, rx) = oneshot::channel();
        queue
            .push(principal(1), Uuid::new_v4(), 0, tx)
            .expect("room");
        drop(rx); // caller went away

        let (tx2, _rx2) = oneshot::channel();
        assert!(queue.push(principal(2), Uuid::new_v4(), 0, tx2).is_ok());
    }

    #[test]
    fn remove_reports_presence() {
        let queue = WaitQueue::new(10);
        let (id, _rx) = park(&queue, 1, 0);
        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert!(queue.is_empty());
    }
}
