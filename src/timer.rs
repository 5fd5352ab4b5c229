//! Timer registry: a binary heap keyed on deadline plus a side table of
//! live entries, addressed by a monotonically increasing, never-reused
//! [`TimerId`].
//!
//! This intentionally does not implement a hierarchical timer wheel. A
//! wheel amortizes insert/cancel to O(1) at the cost of coalescing ticks
//! into discrete buckets; a loop here typically holds a few dozen live
//! timers (connect timeouts, retry backoffs, heartbeat intervals), where a
//! `BinaryHeap`'s O(log n) operations are not a measurable cost and the
//! implementation is trivially correct.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Opaque timer handle. `0` is the sentinel "no timer".
pub type TimerId = u64;

pub type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    callback: TimerCallback,
    period: Option<Duration>,
}

/// Loop-thread-confined registry of pending timers. Not shared directly:
/// it lives inside the [`crate::event_loop::EventLoop`] that owns it and is
/// only ever touched from that loop's thread, the same way the pending-task
/// queue enforces thread confinement for everything else mutable here.
#[derive(Default)]
pub struct TimerRegistry {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, TimerEntry>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), entries: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert (or reinsert, for periodic rescheduling) a timer under an
    /// already-allocated id.
    pub fn schedule(&mut self, id: TimerId, deadline: Instant, period: Option<Duration>, callback: TimerCallback) {
        self.entries.insert(id, TimerEntry { callback, period });
        self.heap.push(Reverse((deadline, id)));
    }

    /// Idempotent: cancelling an unknown or already-fired id is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&id);
        // The stale heap entry, if any, is discarded lazily on pop.
    }

    /// Duration until the next timer should fire, if any is scheduled.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap.peek().map(|Reverse((deadline, _))| deadline.saturating_duration_since(now))
    }

    /// Fire every timer whose deadline has passed, rescheduling periodic
    /// ones. Lazily discards heap entries for cancelled timers.
    pub fn fire_expired(&mut self, now: Instant) {
        loop {
            let Some(Reverse((deadline, id))) = self.heap.peek().copied() else { break };
            if deadline > now {
                break;
            }
            self.heap.pop();
            let Some(mut entry) = self.entries.remove(&id) else {
                continue; // cancelled since scheduling
            };
            (entry.callback)();
            if let Some(period) = entry.period {
                let next_deadline = deadline + period;
                self.entries.insert(id, TimerEntry { callback: entry.callback, period: entry.period });
                self.heap.push(Reverse((next_deadline, id)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_one_shot_exactly_once() {
        let mut reg = TimerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let now = Instant::now();
        reg.schedule(1, now, None, Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }));
        reg.fire_expired(now + Duration::from_millis(1));
        reg.fire_expired(now + Duration::from_millis(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn periodic_timer_reschedules() {
        let mut reg = TimerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let now = Instant::now();
        reg.schedule(1, now, Some(Duration::from_millis(10)), Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }));
        reg.fire_expired(now + Duration::from_millis(35));
        assert!(count.load(Ordering::SeqCst) >= 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn cancel_is_idempotent_and_suppresses_firing() {
        let mut reg = TimerRegistry::new();
        let now = Instant::now();
        reg.schedule(1, now, None, Box::new(|| panic!("should not fire")));
        reg.cancel(1);
        reg.cancel(1);
        reg.fire_expired(now + Duration::from_millis(1));
        assert!(reg.is_empty());
    }

    #[test]
    fn next_timeout_reflects_earliest_deadline() {
        let mut reg = TimerRegistry::new();
        let now = Instant::now();
        reg.schedule(1, now + Duration::from_secs(5), None, Box::new(|| {}));
        reg.schedule(2, now + Duration::from_secs(1), None, Box::new(|| {}));
        let remaining = reg.next_timeout(now).unwrap();
        assert!(remaining <= Duration::from_secs(1));
    }
}
