//! Voucher expiration queue and timer scheduling.
//!
//! A min-heap of `(expiration, voucher)` entries. Entries are removed
//! lazily: dropping a voucher (claimed out or discarded) leaves a stale heap
//! entry behind, which is skipped when popped because the object id no
//! longer resolves to a live voucher. Object ids are never reused, so a
//! stale entry can never be mistaken for a later voucher. Dropping therefore
//! never reschedules the timer; a stale wake-up simply does nothing useful.
//!
//! The daemon runs a single timer task over the queue (see `daemon`); the
//! [`TimerHandle`] lets the repository wake that task when a voucher with an
//! earlier expiration than the scheduled wake-up is enqueued. Enqueuing a
//! later expiration does not reschedule.

use crate::object::ObjectId;
use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Extra delay applied when scheduling the expiration wake-up, batching
/// vouchers that expire close together into one pass.
pub const EXPIRATION_BATCH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct VoucherQueue {
    heap: BinaryHeap<Reverse<(Instant, ObjectId)>>,
}

impl VoucherQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, id: ObjectId, expiration: Instant) {
        self.heap.push(Reverse((expiration, id)));
    }

    /// Earliest queued expiration, possibly from a stale entry.
    pub fn earliest(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((exp, _))| *exp)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pops every entry with `expiration <= now`. The caller filters out
    /// entries whose voucher has already been dropped.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<ObjectId> {
        let mut expired = Vec::new();
        while let Some(Reverse((exp, _))) = self.heap.peek() {
            if *exp > now {
                break;
            }
            let Reverse((_, id)) = self.heap.pop().unwrap();
            expired.push(id);
        }
        expired
    }

    /// Empties the queue, returning all entries. Shutdown drain.
    pub fn drain(&mut self) -> Vec<ObjectId> {
        self.heap.drain().map(|Reverse((_, id))| id).collect()
    }
}

/// Shared scheduling state between the repository (which enqueues vouchers)
/// and the daemon's expiration timer task.
#[derive(Clone, Default)]
pub struct TimerHandle {
    inner: Rc<TimerShared>,
}

#[derive(Default)]
struct TimerShared {
    notify: Notify,
    /// Expiration the timer task is currently sleeping toward, without the
    /// batching delay. `None` while the task is idle or recomputing.
    scheduled: Cell<Option<Instant>>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after enqueuing a voucher expiring at `expiration`: wakes the
    /// timer task only when this is earlier than what it is waiting for.
    pub fn request_wake(&self, expiration: Instant) {
        let earlier = self
            .inner
            .scheduled
            .get()
            .map_or(true, |scheduled| expiration < scheduled);
        if earlier {
            self.inner.notify.notify_one();
        }
    }

    pub(crate) fn set_scheduled(&self, expiration: Option<Instant>) {
        self.inner.scheduled.set(expiration);
    }

    pub(crate) async fn notified(&self) {
        self.inner.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[u64]) -> Vec<ObjectId> {
        v.iter().map(|&i| ObjectId(i)).collect()
    }

    #[test]
    fn pops_in_expiration_order() {
        let now = Instant::now();
        let mut q = VoucherQueue::new();
        q.enqueue(ObjectId(1), now + Duration::from_secs(3));
        q.enqueue(ObjectId(2), now + Duration::from_secs(1));
        q.enqueue(ObjectId(3), now + Duration::from_secs(2));

        assert_eq!(q.earliest(), Some(now + Duration::from_secs(1)));
        assert_eq!(q.pop_expired(now), ids(&[]));
        assert_eq!(q.pop_expired(now + Duration::from_secs(2)), ids(&[2, 3]));
        assert_eq!(q.earliest(), Some(now + Duration::from_secs(3)));
        assert_eq!(q.pop_expired(now + Duration::from_secs(3)), ids(&[1]));
        assert!(q.is_empty());
    }

    #[test]
    fn boundary_expiration_pops_at_exact_instant() {
        let now = Instant::now();
        let mut q = VoucherQueue::new();
        q.enqueue(ObjectId(1), now);
        assert_eq!(q.pop_expired(now), ids(&[1]));
    }

    #[test]
    fn drain_returns_everything() {
        let now = Instant::now();
        let mut q = VoucherQueue::new();
        q.enqueue(ObjectId(1), now + Duration::from_secs(1));
        q.enqueue(ObjectId(2), now + Duration::from_secs(2));
        let mut all = q.drain();
        all.sort_unstable();
        assert_eq!(all, ids(&[1, 2]));
        assert!(q.is_empty());
        assert_eq!(q.earliest(), None);
    }
}
