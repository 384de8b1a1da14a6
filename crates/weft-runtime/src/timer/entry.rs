//! Timer handles and entry state

use core::fmt;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Shared, re-runnable timer callback. Recurring timers fire the same
/// callable on every period, so it is `Fn` behind an `Arc`.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Liveness witness for condition timers: the callback is dropped
/// silently if this no longer upgrades at expiry.
pub type Cond = Weak<dyn Any + Send + Sync>;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for cancelling or resetting a timer.
///
/// Handles stay valid after the timer fires or is cancelled; operations
/// on a dead handle are no-ops.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub(crate) fn next() -> Self {
        TimerHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerHandle({})", self.0)
    }
}

/// Live state of one registered timer.
pub(crate) struct TimerEntry {
    /// Absolute deadline, monotonic ms
    pub deadline: u64,
    /// Interval; the original delay for one-shot timers
    pub period: u64,
    pub recurring: bool,
    pub callback: TimerCallback,
    pub cond: Option<Cond>,
    /// Bumped on every re-arm; heap slots carrying an older generation
    /// are stale and skipped
    pub generation: u32,
}
