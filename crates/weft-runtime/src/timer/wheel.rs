//! Min-heap timer wheel
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel / reset: O(1) amortized (lazy, generation-stamped)
//! - Drain expired: O(k log n) for k due timers
//!
//! # Cancellation strategy
//!
//! Cancelling removes the entry from the live map only; the heap slot
//! stays behind and is skipped when it surfaces. Reset bumps the entry's
//! generation and pushes a fresh slot, invalidating the old one the same
//! way. This keeps every mutation cheap at the cost of dead slots that
//! drain out naturally.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};

use parking_lot::{Mutex, RwLock};

use super::entry::{Cond, TimerCallback, TimerEntry, TimerHandle};
use super::now_ms;

/// Backward jump, in ms, beyond which the clock is considered to have
/// rolled over and every outstanding timer is treated as expired.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Heap slot; the live map is the source of truth, the slot is only a
/// sorted pointer into it.
struct HeapSlot {
    deadline: u64,
    /// Insertion sequence; ties on deadline fire in insertion order
    seq: u64,
    handle: TimerHandle,
    generation: u32,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for a min-heap: earliest deadline, then lowest seq
        match other.deadline.cmp(&self.deadline) {
            CmpOrdering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct WheelInner {
    heap: BinaryHeap<HeapSlot>,
    live: HashMap<TimerHandle, TimerEntry>,
    next_seq: u64,
    /// `now` observed by the previous drain, for rollover detection
    last_now: u64,
}

impl WheelInner {
    fn push_slot(&mut self, handle: TimerHandle, deadline: u64, generation: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapSlot {
            deadline,
            seq,
            handle,
            generation,
        });
    }

    /// Deadline of the earliest non-stale slot, dropping stale slots on
    /// the way.
    fn head_deadline(&mut self) -> Option<u64> {
        loop {
            let (deadline, handle, generation) = match self.heap.peek() {
                Some(top) => (top.deadline, top.handle, top.generation),
                None => return None,
            };
            let current = matches!(
                self.live.get(&handle),
                Some(e) if e.generation == generation
            );
            if current {
                return Some(deadline);
            }
            self.heap.pop();
        }
    }
}

/// Min-heap of absolute-deadline timers.
pub struct TimerWheel {
    inner: Mutex<WheelInner>,
    /// Invoked (outside the lock) whenever an insertion or reset creates
    /// a new earliest deadline; the reactor points this at `tickle` so
    /// the idle loop recomputes its blocking budget.
    front_hook: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            inner: Mutex::new(WheelInner {
                heap: BinaryHeap::new(),
                live: HashMap::new(),
                next_seq: 0,
                last_now: now_ms(),
            }),
            front_hook: RwLock::new(None),
        }
    }

    /// Install the new-earliest-deadline notification.
    pub fn set_front_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.front_hook.write() = Some(Box::new(hook));
    }

    /// Register a timer firing `delay_ms` from now. Recurring timers
    /// re-arm at `deadline + period` each time they fire.
    pub fn add_timer<F>(&self, delay_ms: u64, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(delay_ms, std::sync::Arc::new(callback), recurring, None)
    }

    /// Register a one-shot timer whose callback only runs if `cond`
    /// still upgrades at expiry.
    pub fn add_condition_timer<F>(&self, delay_ms: u64, callback: F, cond: Cond) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(delay_ms, std::sync::Arc::new(callback), false, Some(cond))
    }

    fn insert(
        &self,
        delay_ms: u64,
        callback: TimerCallback,
        recurring: bool,
        cond: Option<Cond>,
    ) -> TimerHandle {
        // A zero-period recurring timer would re-expire inside a single
        // drain; clamp to the clock granularity.
        let period = if recurring { delay_ms.max(1) } else { delay_ms };
        let handle = TimerHandle::next();
        let deadline = now_ms() + delay_ms;

        let at_front = {
            let mut inner = self.inner.lock();
            let at_front = match inner.head_deadline() {
                Some(head) => deadline < head,
                None => true,
            };
            inner.live.insert(
                handle,
                TimerEntry {
                    deadline,
                    period,
                    recurring,
                    callback,
                    cond,
                    generation: 0,
                },
            );
            inner.push_slot(handle, deadline, 0);
            at_front
        };

        if at_front {
            self.notify_front();
        }
        handle
    }

    /// Cancel a timer. Safe on handles that already fired or were
    /// cancelled; returns whether a live entry was removed.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.inner.lock().live.remove(&handle).is_some()
    }

    /// Re-arm a timer with a new delay. With `from_now` the deadline is
    /// measured from the current instant; otherwise from the entry's
    /// original start. Returns false for dead handles.
    pub fn reset(&self, handle: TimerHandle, new_delay_ms: u64, from_now: bool) -> bool {
        let at_front = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.live.get_mut(&handle) else {
                return false;
            };
            if !from_now && entry.period == new_delay_ms {
                return true;
            }
            let start = if from_now {
                now_ms()
            } else {
                entry.deadline.saturating_sub(entry.period)
            };
            entry.period = if entry.recurring {
                new_delay_ms.max(1)
            } else {
                new_delay_ms
            };
            entry.deadline = start + new_delay_ms;
            entry.generation = entry.generation.wrapping_add(1);
            let (deadline, generation) = (entry.deadline, entry.generation);
            inner.push_slot(handle, deadline, generation);

            let head = inner.head_deadline();
            head == Some(deadline)
        };

        if at_front {
            self.notify_front();
        }
        true
    }

    /// Drain every timer whose deadline has passed, in deadline order
    /// (insertion order for ties). Recurring entries are re-armed at
    /// `deadline + period`; condition entries whose witness is gone are
    /// dropped silently.
    ///
    /// If the clock is observed more than an hour earlier than on the
    /// previous drain, every outstanding entry is treated as expired.
    /// CLOCK_MONOTONIC cannot do that; the defence is kept for exotic
    /// clock sources.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let mut inner = self.inner.lock();
        let now = now_ms();
        let rollover = detect_clock_rollover(inner.last_now, now);
        inner.last_now = now;

        if !rollover {
            match inner.head_deadline() {
                Some(head) if head <= now => {}
                _ => return Vec::new(),
            }
        }

        let mut expired = Vec::new();
        // Re-arms are pushed after the drain so a recurring timer cannot
        // be popped twice in one pass.
        let mut rearm: Vec<(TimerHandle, u64, u32)> = Vec::new();

        loop {
            let due = match inner.heap.peek() {
                Some(top) => rollover || top.deadline <= now,
                None => false,
            };
            if !due {
                break;
            }
            let slot = inner.heap.pop().expect("heap entry");

            let (stale, witness_gone, callback, recurring) =
                match inner.live.get(&slot.handle) {
                    Some(e) => (
                        e.generation != slot.generation,
                        e.cond
                            .as_ref()
                            .map(|c| c.upgrade().is_none())
                            .unwrap_or(false),
                        Some(e.callback.clone()),
                        e.recurring,
                    ),
                    None => (true, false, None, false),
                };
            if stale {
                continue;
            }
            if witness_gone {
                inner.live.remove(&slot.handle);
                continue;
            }

            expired.push(callback.expect("live entry has a callback"));
            if recurring {
                let entry = inner.live.get_mut(&slot.handle).expect("live entry");
                entry.deadline += entry.period;
                entry.generation = entry.generation.wrapping_add(1);
                rearm.push((slot.handle, entry.deadline, entry.generation));
            } else {
                inner.live.remove(&slot.handle);
            }
        }

        for (handle, deadline, generation) in rearm {
            inner.push_slot(handle, deadline, generation);
        }
        expired
    }

    /// Milliseconds until the earliest deadline; 0 if already due; None
    /// when no timers are outstanding.
    pub fn time_to_next(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        inner
            .head_deadline()
            .map(|head| head.saturating_sub(now_ms()))
    }

    /// Whether any timer is outstanding.
    pub fn has_timers(&self) -> bool {
        self.inner.lock().head_deadline().is_some()
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify_front(&self) {
        if let Some(hook) = &*self.front_hook.read() {
            hook();
        }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

/// True when `now` sits implausibly far before the previous observation.
fn detect_clock_rollover(last_now: u64, now: u64) -> bool {
    now < last_now && last_now - now > ROLLOVER_WINDOW_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_expire_in_deadline_order() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(30u64, 3u32), (10, 1), (20, 2)] {
            let f = fired.clone();
            wheel.add_timer(delay, move || f.lock().push(tag), false);
        }

        std::thread::sleep(Duration::from_millis(50));
        for cb in wheel.list_expired() {
            cb();
        }
        assert_eq!(*fired.lock(), vec![1, 2, 3]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..5u32 {
            let f = fired.clone();
            wheel.add_timer(5, move || f.lock().push(tag), false);
        }

        std::thread::sleep(Duration::from_millis(20));
        for cb in wheel.list_expired() {
            cb();
        }
        assert_eq!(*fired.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel_suppresses_fire() {
        let wheel = TimerWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let handle = wheel.add_timer(5, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, false);

        assert!(wheel.cancel(handle));
        assert!(!wheel.cancel(handle));

        std::thread::sleep(Duration::from_millis(15));
        assert!(wheel.list_expired().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_time_to_next() {
        let wheel = TimerWheel::new();
        assert_eq!(wheel.time_to_next(), None);

        wheel.add_timer(5000, || {}, false);
        let remaining = wheel.time_to_next().unwrap();
        assert!(remaining > 4000 && remaining <= 5000);
    }

    #[test]
    fn test_recurring_rearms() {
        let wheel = TimerWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        wheel.add_timer(20, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, true);

        std::thread::sleep(Duration::from_millis(30));
        let batch = wheel.list_expired();
        assert_eq!(batch.len(), 1);
        for cb in batch {
            cb();
        }
        assert_eq!(wheel.len(), 1);

        std::thread::sleep(Duration::from_millis(25));
        let batch = wheel.list_expired();
        assert_eq!(batch.len(), 1);
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn test_reset_from_now_pushes_deadline_out() {
        let wheel = TimerWheel::new();
        let handle = wheel.add_timer(10, || {}, false);
        assert!(wheel.reset(handle, 5000, true));

        std::thread::sleep(Duration::from_millis(25));
        assert!(wheel.list_expired().is_empty());
        let remaining = wheel.time_to_next().unwrap();
        assert!(remaining > 4000);
    }

    #[test]
    fn test_reset_dead_handle() {
        let wheel = TimerWheel::new();
        let handle = wheel.add_timer(1, || {}, false);
        std::thread::sleep(Duration::from_millis(10));
        let _ = wheel.list_expired();
        assert!(!wheel.reset(handle, 100, true));
    }

    #[test]
    fn test_condition_timer_dropped_witness() {
        let wheel = TimerWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let witness: Arc<dyn std::any::Any + Send + Sync> = Arc::new(1u32);
        let h = hits.clone();
        wheel.add_condition_timer(5, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, Arc::downgrade(&witness));
        drop(witness);

        std::thread::sleep(Duration::from_millis(15));
        assert!(wheel.list_expired().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_condition_timer_live_witness() {
        let wheel = TimerWheel::new();
        let witness: Arc<dyn std::any::Any + Send + Sync> = Arc::new(1u32);
        wheel.add_condition_timer(5, || {}, Arc::downgrade(&witness));

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(wheel.list_expired().len(), 1);
    }

    #[test]
    fn test_front_hook_fires_on_new_head() {
        let wheel = TimerWheel::new();
        let pokes = Arc::new(AtomicUsize::new(0));
        let p = pokes.clone();
        wheel.set_front_hook(move || {
            p.fetch_add(1, Ordering::SeqCst);
        });

        wheel.add_timer(10_000, || {}, false);
        assert_eq!(pokes.load(Ordering::SeqCst), 1);

        // Later deadline, head unchanged
        wheel.add_timer(20_000, || {}, false);
        assert_eq!(pokes.load(Ordering::SeqCst), 1);

        // Earlier deadline, new head
        wheel.add_timer(100, || {}, false);
        assert_eq!(pokes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rollover_detection() {
        assert!(!detect_clock_rollover(1000, 2000));
        assert!(!detect_clock_rollover(2000, 1000));
        let hour = 60 * 60 * 1000;
        assert!(detect_clock_rollover(2 * hour + 1000, 500));
    }
}
