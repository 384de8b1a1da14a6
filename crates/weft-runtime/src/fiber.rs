//! Stackful, non-symmetric fibers
//!
//! A fiber owns a private guarded stack and a saved CPU context. It is
//! resumed by whoever calls [`Fiber::resume`] and suspends only back to
//! that resumer; there is no sibling-to-sibling transfer. The fiber that
//! represents a thread's native stack (the *main fiber*) is materialized
//! lazily the first time the thread touches the fiber API and owns no
//! heap stack.
//!
//! The entry point runs under a catch-all guard: a normal return parks
//! the fiber in `Term`, a panic unwinds to the guard and parks it in
//! `Except`. Either way control switches straight back to the resumer,
//! so a failure can never corrupt the resumer's own control flow.

use std::cell::RefCell;
use std::cell::UnsafeCell;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use weft_core::error::WeftResult;
use weft_core::werror;
use weft_core::{FiberId, FiberState};

use crate::arch;
use crate::config;
use crate::stack::FiberStack;

/// Boxed fiber entry point.
pub type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// Live fibers in the process, main fibers included.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The fiber currently executing on this thread. Holding the Arc
    /// here keeps the whole resumer chain alive while it is suspended
    /// in `switch_context` frames.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A stackful fiber.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// None for the per-thread main fiber, which runs on the native stack.
    stack: Option<FiberStack>,
    ctx: UnsafeCell<arch::Context>,
    entry: Mutex<Option<EntryFn>>,
    /// Recorded at each resume; taken back at each suspension.
    resumer: Mutex<Option<Arc<Fiber>>>,
}

// Safety: `ctx` is only written by switch_context, and only ever by the
// thread that is resuming or suspending this fiber. Handoffs between
// threads are serialized through the scheduler queue lock (a fiber sits
// in the queue, or is parked in exactly one reactor slot/timer, between
// runs), which establishes the necessary happens-before edges. `entry`
// and `resumer` are behind mutexes, `state` is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber around `entry` with the given stack size.
    /// A `stack_size` of 0 uses the configured default.
    pub fn new<F>(entry: F, stack_size: usize) -> WeftResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            config::config().stack_size
        } else {
            stack_size
        };
        let stack = FiberStack::alloc(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            stack: Some(stack),
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            entry: Mutex::new(Some(Box::new(entry))),
            resumer: Mutex::new(None),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        fiber.init_context();
        Ok(fiber)
    }

    /// Main fiber for the calling thread; no heap stack, already `Exec`.
    fn new_main() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::MAIN,
            state: AtomicU8::new(FiberState::Exec as u8),
            stack: None,
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            entry: Mutex::new(None),
            resumer: Mutex::new(None),
        })
    }

    /// Stage the initial context so the first resume lands in
    /// `fiber_main` with a pointer to this fiber. `&self` points into
    /// the Arc allocation, so the staged pointer stays valid as long as
    /// any reference does.
    fn init_context(&self) {
        let stack = self.stack.as_ref().expect("main fiber has no entry context");
        unsafe {
            arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_main as usize,
                self as *const Fiber as usize,
            );
        }
    }

    /// Rearm a finished (or never-started) fiber with a new entry point,
    /// reusing its stack. State returns to `Init`.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "reset in state {}",
            state
        );
        assert!(self.stack.is_some(), "cannot reset a main fiber");

        *self.entry.lock() = Some(Box::new(entry));
        self.init_context();
        self.set_state(FiberState::Init);
    }

    /// Transfer the CPU to this fiber. The caller becomes the fiber's
    /// resumer and regains control when the fiber yields or terminates.
    ///
    /// Takes the `Arc` by value: that reference is what keeps the fiber
    /// alive while it runs (it is parked in the current-fiber slot for
    /// the duration). Callers that need the fiber afterwards resume a
    /// clone.
    pub fn resume(self: Arc<Self>) {
        let state = self.state();
        assert!(state.is_resumable(), "resume in state {}", state);

        let prev = Fiber::current();
        assert!(!Arc::ptr_eq(&prev, &self), "fiber cannot resume itself");

        *self.resumer.lock() = Some(prev.clone());
        self.set_state(FiberState::Exec);

        let save = prev.ctx.get();
        let load = self.ctx.get();
        set_current(self);

        unsafe {
            arch::switch_context(save, load);
        }
        // Back here once the target suspended or terminated; the far
        // side already restored the current-fiber slot to `prev`.
    }

    /// Suspend the current fiber as `Hold`: it will not run again until
    /// something that holds a reference resumes or schedules it.
    pub fn yield_hold() {
        Self::yield_back(Fiber::current(), FiberState::Hold);
    }

    /// Suspend the current fiber as `Ready`: the scheduler puts it back
    /// on the run queue.
    pub fn yield_ready() {
        Self::yield_back(Fiber::current(), FiberState::Ready);
    }

    fn yield_back(cur: Arc<Fiber>, new_state: FiberState) {
        assert_eq!(cur.state(), FiberState::Exec, "yield outside EXEC");
        let resumer = cur
            .resumer
            .lock()
            .take()
            .expect("fiber has no resumer (main fiber cannot yield)");

        cur.set_state(new_state);
        set_current(resumer.clone());

        let save = cur.ctx.get();
        let load = resumer.ctx.get();
        // Drop both Arcs before switching: the resumer survives through
        // the current-fiber slot, this fiber through its resumer's
        // stack frame. Holding our own Arc across a park would keep a
        // dropped-while-parked fiber alive forever.
        drop(resumer);
        drop(cur);
        unsafe {
            arch::switch_context(save, load);
        }
        // Resumed again: the resuming side re-populated the TLS slot.
    }

    /// The fiber currently executing on this thread, materializing the
    /// thread's main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        let existing = CURRENT.with(|c| c.borrow().clone());
        match existing {
            Some(f) => f,
            None => {
                let main = Fiber::new_main();
                CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
                main
            }
        }
    }

    /// Id of the currently executing fiber, 0 when outside any fiber.
    pub fn running_id() -> u64 {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .map(|f| f.id().as_u64())
                .unwrap_or(0)
        })
    }

    /// Whether the calling code runs inside a non-main fiber.
    pub fn in_worker_fiber() -> bool {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .map(|f| !f.is_main())
                .unwrap_or(false)
        })
    }

    /// Live fibers in the process.
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Main fibers run on the thread's native stack.
    #[inline]
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            // A dropped fiber with a live stack frame would leak that
            // frame's locals; the last reference must see it finished
            // or never started.
            debug_assert!(
                matches!(
                    self.state(),
                    FiberState::Init | FiberState::Term | FiberState::Except
                ),
                "fiber {} dropped in state {}",
                self.id,
                self.state()
            );
        }
    }
}

#[inline]
fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
}

/// Entry guard every fiber starts in. Runs the entry closure, records
/// the terminal state, and switches back to the resumer. All owned
/// references are dropped before the final switch: this frame never
/// runs again, so anything still held here would leak.
extern "C" fn fiber_main(raw: usize) {
    let fiber: &Fiber = unsafe { &*(raw as *const Fiber) };

    let entry = fiber.entry.lock().take();
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        if let Some(f) = entry {
            f();
        }
    }));
    match result {
        Ok(()) => fiber.set_state(FiberState::Term),
        Err(_) => {
            werror!("fiber {} panicked; parking as EXCEPT", fiber.id);
            fiber.set_state(FiberState::Except);
        }
    }

    let resumer = fiber
        .resumer
        .lock()
        .take()
        .expect("terminating fiber has no resumer");
    let save = fiber.ctx.get();
    let load = resumer.ctx.get();
    // Park the resumer Arc in TLS so it outlives the switch; the fiber
    // itself is kept alive by the resumer's stack frame.
    set_current(resumer);

    unsafe {
        arch::switch_context(save, load);
    }
    unreachable!("terminated fiber resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_main_fiber_identity() {
        let a = Fiber::current();
        let b = Fiber::current();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_main());
        assert_eq!(a.state(), FiberState::Exec);
    }

    #[test]
    fn test_run_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
        )
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Init);
        fiber.clone().resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_ready_round_trip() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_ready();
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
        )
        .unwrap();

        fiber.clone().resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(steps.load(Ordering::SeqCst), 1);

        fiber.clone().resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_yield_hold_round_trip() {
        let fiber = Fiber::new(
            || {
                Fiber::yield_hold();
            },
            0,
        )
        .unwrap();

        fiber.clone().resume();
        assert_eq!(fiber.state(), FiberState::Hold);
        fiber.clone().resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_panic_becomes_except() {
        weft_core::wlog::set_log_level(weft_core::LogLevel::Off);
        let fiber = Fiber::new(
            || {
                panic!("boom");
            },
            0,
        )
        .unwrap();

        fiber.clone().resume();
        assert_eq!(fiber.state(), FiberState::Except);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
        )
        .unwrap();
        fiber.clone().resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.clone().resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_ids_and_count() {
        let before = Fiber::total();
        let f1 = Fiber::new(|| {}, 0).unwrap();
        let f2 = Fiber::new(|| {}, 0).unwrap();
        assert_ne!(f1.id(), f2.id());
        assert!(Fiber::total() >= before + 2);
        f1.clone().resume();
        f2.clone().resume();
        drop(f1);
        drop(f2);
    }

    #[test]
    fn test_running_id_inside_fiber() {
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let fiber = Fiber::new(
            move || {
                s.store(Fiber::running_id(), Ordering::SeqCst);
            },
            0,
        )
        .unwrap();
        let id = fiber.id().as_u64();
        fiber.clone().resume();
        assert_eq!(seen.load(Ordering::SeqCst), id);
    }
}
