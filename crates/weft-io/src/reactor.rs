//! epoll reactor
//!
//! Extends the scheduler with readiness-driven wakeups: fibers (or bare
//! callbacks) park on a (fd, event) pair and are re-enqueued when the
//! kernel reports progress, a timer fires, or the registration is
//! cancelled. The reactor installs itself as the scheduler's [`Driver`]:
//! its idle fiber blocks in `epoll_wait` with the timer wheel's next
//! deadline as the budget, and `tickle` unblocks that wait through a
//! self-pipe.
//!
//! Registrations are edge-triggered and one-shot: firing an event clears
//! it from the registered mask, and the woken code re-arms explicitly if
//! it still cares.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use weft_core::error::{os_error, WeftResult};
use weft_core::{werror, winfo};

use weft_runtime::scheduler::{Driver, Scheduler, Task, TaskFn, WeakScheduler};
use weft_runtime::timer::{Cond, TimerHandle, TimerWheel};
use weft_runtime::Fiber;

use crate::errno::errno;

/// Largest readiness batch drained per idle iteration.
const MAX_EVENTS: usize = 256;

/// Liveness floor: the idle fiber never blocks longer than this, so a
/// missed wakeup costs at most one tick.
const MAX_TIMEOUT_MS: u64 = 3000;

/// Readiness a continuation can park on.
///
/// The bit values mirror `EPOLLIN`/`EPOLLOUT`, so registered masks and
/// kernel reports intersect directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read,
    Write,
}

impl IoEvent {
    #[inline]
    fn bit(self) -> u32 {
        match self {
            IoEvent::Read => libc::EPOLLIN as u32,
            IoEvent::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// What wakes up when an event fires.
enum Continuation {
    /// Re-enqueue this parked fiber
    Fiber(Arc<Fiber>),
    /// Enqueue this callback as a fresh task
    Callback(TaskFn),
}

/// One armed (fd, event) registration.
struct EventSlot {
    sched: Scheduler,
    cont: Continuation,
}

/// Registration state of one fd.
struct SlotState {
    /// Mask of armed events, mirrored into the kernel with EPOLLET
    registered: u32,
    read: Option<EventSlot>,
    write: Option<EventSlot>,
}

struct FdSlot {
    fd: RawFd,
    state: Mutex<SlotState>,
}

impl FdSlot {
    fn new(fd: RawFd) -> FdSlot {
        FdSlot {
            fd,
            state: Mutex::new(SlotState {
                registered: 0,
                read: None,
                write: None,
            }),
        }
    }
}

struct ReactorCore {
    epfd: RawFd,
    /// Self-pipe; [0] read end is registered in epoll, [1] is written
    /// by `tickle`
    tickle_fds: [RawFd; 2],
    /// Armed registrations not yet fired
    pending: AtomicUsize,
    slots: RwLock<Vec<Arc<FdSlot>>>,
    wheel: TimerWheel,
    sched: OnceLock<WeakScheduler>,
    self_weak: OnceLock<Weak<ReactorCore>>,
}

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Reactor>> = const { RefCell::new(None) };
}

/// Handle to a reactor; clones share the same instance.
#[derive(Clone)]
pub struct Reactor {
    sched: Scheduler,
    core: Arc<ReactorCore>,
}

impl Reactor {
    /// Build the reactor, install it as the scheduler driver, and start
    /// the worker pool.
    pub fn new(worker_count: usize, use_caller: bool, name: &str) -> WeftResult<Reactor> {
        let sched = Scheduler::new(worker_count, use_caller, name)?;

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(os_error("epoll_create1"));
        }

        let mut pipe_fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rt != 0 {
            unsafe { libc::close(epfd) };
            return Err(os_error("pipe2"));
        }

        let core = Arc::new(ReactorCore {
            epfd,
            tickle_fds: pipe_fds,
            pending: AtomicUsize::new(0),
            slots: RwLock::new(Vec::new()),
            wheel: TimerWheel::new(),
            sched: OnceLock::new(),
            self_weak: OnceLock::new(),
        });
        let _ = core.sched.set(sched.downgrade());
        let _ = core.self_weak.set(Arc::downgrade(&core));

        // Watch the self-pipe read end, edge-triggered like everything
        // else; its slot in epoll data is the fd itself.
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) };
        if rt != 0 {
            return Err(os_error("epoll_ctl"));
        }

        // A new earliest deadline shortens the epoll budget; poke the
        // idle fiber so it recomputes.
        let weak = Arc::downgrade(&core);
        core.wheel.set_front_hook(move || {
            if let Some(core) = weak.upgrade() {
                core.tickle();
            }
        });

        sched.set_driver(core.clone());

        let reactor = Reactor {
            sched: sched.clone(),
            core,
        };
        set_current_reactor(Some(reactor.clone()));
        sched.start()?;
        Ok(reactor)
    }

    /// Reactor the current thread belongs to, if any.
    pub fn current() -> Option<Reactor> {
        CURRENT_REACTOR.with(|c| c.borrow().clone())
    }

    /// Park a continuation on (fd, event). With a callback the callback
    /// is enqueued on readiness; without one the *current fiber* is
    /// parked and re-enqueued instead.
    ///
    /// Registering an event that is already armed on the fd is a
    /// programming error and panics.
    pub fn add_event(&self, fd: RawFd, event: IoEvent, cb: Option<TaskFn>) -> WeftResult<()> {
        let sched = Scheduler::current().unwrap_or_else(|| self.sched.clone());
        self.core.add_event(fd, event, cb, sched)
    }

    /// Disarm (fd, event) without waking the parked continuation.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        self.core.del_event(fd, event)
    }

    /// Disarm (fd, event) and fire the parked continuation exactly
    /// once. The woken code discovers cancellation by its own logic.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        self.core.cancel_event(fd, event)
    }

    /// Disarm everything on `fd`, firing both slots. Used by the close
    /// hook so nothing stays parked on a dead descriptor.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.core.cancel_all(fd)
    }

    /// One-shot or recurring timer; fired callbacks run as scheduler
    /// tasks.
    pub fn add_timer<F>(&self, delay_ms: u64, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.wheel.add_timer(delay_ms, cb, recurring)
    }

    /// Timer whose callback runs only if `cond` still upgrades at
    /// expiry.
    pub fn add_condition_timer<F>(&self, delay_ms: u64, cb: F, cond: Cond) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.wheel.add_condition_timer(delay_ms, cb, cond)
    }

    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.core.wheel.cancel(handle)
    }

    pub fn reset_timer(&self, handle: TimerHandle, delay_ms: u64, from_now: bool) -> bool {
        self.core.wheel.reset(handle, delay_ms, from_now)
    }

    /// Armed registrations not yet fired.
    pub fn pending_events(&self) -> usize {
        self.core.pending.load(Ordering::Acquire)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Admit a task to the underlying scheduler.
    pub fn schedule(&self, task: Task) {
        self.sched.schedule(task);
    }

    /// Drain and shut down. Blocks until outstanding timers and events
    /// resolve and every queued task has run.
    pub fn stop(&self) {
        self.sched.stop();
    }
}

fn set_current_reactor(reactor: Option<Reactor>) {
    CURRENT_REACTOR.with(|c| *c.borrow_mut() = reactor);
}

impl ReactorCore {
    fn sched(&self) -> Option<Scheduler> {
        self.sched.get()?.upgrade()
    }

    /// Slot for `fd`, growing the table by 1.5x when it falls short.
    fn slot_for(&self, fd: RawFd) -> Arc<FdSlot> {
        let idx = fd as usize;
        {
            let slots = self.slots.read();
            if idx < slots.len() {
                return slots[idx].clone();
            }
        }
        let mut slots = self.slots.write();
        if idx >= slots.len() {
            let new_len = ((idx + 1) * 3 / 2).max(32);
            let mut i = slots.len();
            slots.resize_with(new_len, || {
                let slot = Arc::new(FdSlot::new(i as RawFd));
                i += 1;
                slot
            });
        }
        slots[idx].clone()
    }

    fn existing_slot(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        let slots = self.slots.read();
        slots.get(fd as usize).cloned()
    }

    fn add_event(
        &self,
        fd: RawFd,
        event: IoEvent,
        cb: Option<TaskFn>,
        sched: Scheduler,
    ) -> WeftResult<()> {
        let slot = self.slot_for(fd);
        let mut st = slot.state.lock();

        assert!(
            st.registered & event.bit() == 0,
            "duplicate registration of {:?} on fd {}",
            event,
            fd
        );

        let op = if st.registered != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | st.registered | event.bit(),
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            let err = os_error("epoll_ctl");
            werror!("reactor: epoll_ctl(op={}, fd={}) failed: {}", op, fd, err);
            return Err(err);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        st.registered |= event.bit();

        let cont = match cb {
            Some(f) => Continuation::Callback(f),
            None => {
                let cur = Fiber::current();
                debug_assert!(!cur.is_main(), "cannot park a thread main fiber");
                Continuation::Fiber(cur)
            }
        };
        let entry = EventSlot { sched, cont };
        match event {
            IoEvent::Read => {
                debug_assert!(st.read.is_none());
                st.read = Some(entry);
            }
            IoEvent::Write => {
                debug_assert!(st.write.is_none());
                st.write = Some(entry);
            }
        }
        Ok(())
    }

    fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let Some(slot) = self.existing_slot(fd) else {
            return false;
        };
        let mut st = slot.state.lock();
        if st.registered & event.bit() == 0 {
            return false;
        }

        if !self.sync_mask(fd, st.registered & !event.bit()) {
            return false;
        }
        st.registered &= !event.bit();
        match event {
            IoEvent::Read => st.read = None,
            IoEvent::Write => st.write = None,
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let Some(slot) = self.existing_slot(fd) else {
            return false;
        };
        let mut st = slot.state.lock();
        if st.registered & event.bit() == 0 {
            return false;
        }

        if !self.sync_mask(fd, st.registered & !event.bit()) {
            return false;
        }
        Self::trigger(&mut st, event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(slot) = self.existing_slot(fd) else {
            return false;
        };
        let mut st = slot.state.lock();
        if st.registered == 0 {
            return false;
        }

        self.sync_mask(fd, 0);
        if st.registered & IoEvent::Read.bit() != 0 {
            Self::trigger(&mut st, IoEvent::Read);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if st.registered & IoEvent::Write.bit() != 0 {
            Self::trigger(&mut st, IoEvent::Write);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert_eq!(st.registered, 0);
        true
    }

    /// Mirror a new registration mask into the kernel table.
    fn sync_mask(&self, fd: RawFd, new_mask: u32) -> bool {
        let op = if new_mask != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | new_mask,
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            werror!(
                "reactor: epoll_ctl(op={}, fd={}) failed: errno {}",
                op,
                fd,
                errno()
            );
            return false;
        }
        true
    }

    /// Consume one armed slot: clear its bit and enqueue the parked
    /// continuation into the scheduler it was registered under.
    fn trigger(st: &mut SlotState, event: IoEvent) {
        debug_assert!(st.registered & event.bit() != 0);
        st.registered &= !event.bit();
        let entry = match event {
            IoEvent::Read => st.read.take(),
            IoEvent::Write => st.write.take(),
        };
        if let Some(EventSlot { sched, cont }) = entry {
            match cont {
                Continuation::Fiber(fiber) => sched.schedule(Task::from_fiber(fiber)),
                Continuation::Callback(cb) => sched.schedule(Task::from_fn(move || cb())),
            }
        }
    }

    fn tickle(&self) {
        let Some(sched) = self.sched() else {
            return;
        };
        // Nobody is parked in epoll_wait; a write would only be drained
        // later for nothing. A worker that is between queue scans picks
        // the work up on its next pass anyway.
        if !sched.has_idle_workers() {
            return;
        }
        let byte = [b'T'];
        unsafe {
            libc::write(self.tickle_fds[1], byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Driver for ReactorCore {
    fn on_thread_start(&self) {
        let reactor = self
            .self_weak
            .get()
            .and_then(|w| w.upgrade())
            .and_then(|core| {
                core.sched().map(|sched| Reactor { sched, core })
            });
        set_current_reactor(reactor);
    }

    fn tickle(&self) {
        ReactorCore::tickle(self);
    }

    fn stopping(&self) -> bool {
        let Some(sched) = self.sched() else {
            return true;
        };
        !self.wheel.has_timers()
            && self.pending.load(Ordering::Acquire) == 0
            && sched.base_stopping()
    }

    /// The reactor's idle fiber: block in epoll up to the next timer
    /// deadline, drain expired timers and readiness reports, then yield
    /// back so the worker can run whatever got enqueued.
    fn idle(&self) {
        let Some(sched) = self.sched() else {
            return;
        };
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if Driver::stopping(self) {
                winfo!("reactor {}: idle exiting", sched.name());
                break;
            }

            let timeout = match self.wheel.time_to_next() {
                Some(ms) => ms.min(MAX_TIMEOUT_MS),
                None => MAX_TIMEOUT_MS,
            } as libc::c_int;

            let n = loop {
                let rt = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout)
                };
                // EINTR is not a wakeup, re-enter with the same budget.
                if rt < 0 && errno() == libc::EINTR {
                    continue;
                }
                break rt;
            };
            if n < 0 {
                werror!("reactor: epoll_wait failed: errno {}", errno());
                Fiber::yield_hold();
                continue;
            }

            // Expired timers are admitted before readiness so deadline
            // order is preserved in the queue.
            let expired = self.wheel.list_expired();
            if !expired.is_empty() {
                let tasks = expired
                    .into_iter()
                    .map(|cb| Task::from_fn(move || cb()))
                    .collect();
                sched.schedule_all(tasks);
            }

            for ev in &events[..n as usize] {
                let key = ev.u64;
                if key == self.tickle_fds[0] as u64 {
                    self.drain_tickle_pipe();
                    continue;
                }

                let fd = key as RawFd;
                let Some(slot) = self.existing_slot(fd) else {
                    continue;
                };
                let mut st = slot.state.lock();

                let mut reported = ev.events;
                // Error/hangup without readable/writable would leave a
                // parked fiber stranded: synthesize both directions
                // against whatever is still registered and let the
                // woken code diagnose via its next call.
                if reported & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    reported |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & st.registered;
                }
                // Only bits still armed count: anything else was
                // cancelled in the window between epoll_wait and the
                // slot lock.
                let real =
                    reported & (IoEvent::Read.bit() | IoEvent::Write.bit()) & st.registered;
                if real == 0 {
                    continue;
                }

                let left = st.registered & !real;
                if !self.sync_mask(slot.fd, left) {
                    continue;
                }
                if real & IoEvent::Read.bit() != 0 {
                    Self::trigger(&mut st, IoEvent::Read);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if real & IoEvent::Write.bit() != 0 {
                    Self::trigger(&mut st, IoEvent::Write);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Hand the CPU back to the scheduling fiber; it re-enters
            // this loop once the queue is empty again.
            Fiber::yield_hold();
        }
    }
}

impl Drop for ReactorCore {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rt = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rt, 0);
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }
        (fds[0], fds[1])
    }

    fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_start_stop() {
        let reactor = Reactor::new(1, false, "r-lifecycle").unwrap();
        assert_eq!(reactor.pending_events(), 0);
        reactor.stop();
    }

    #[test]
    fn test_read_event_fires_on_data() {
        let reactor = Reactor::new(1, false, "r-read").unwrap();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        reactor
            .add_event(a, IoEvent::Read, Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        assert_eq!(reactor.pending_events(), 1);

        let msg = b"x";
        unsafe { libc::write(b, msg.as_ptr() as *const libc::c_void, 1) };

        assert!(wait_for(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(reactor.pending_events(), 0);

        reactor.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_write_event_fires_immediately() {
        let reactor = Reactor::new(1, false, "r-write").unwrap();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        reactor
            .add_event(a, IoEvent::Write, Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        assert!(wait_for(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 1
        }));

        reactor.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_cancel_event_fires_without_readiness() {
        let reactor = Reactor::new(1, false, "r-cancel").unwrap();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        reactor
            .add_event(a, IoEvent::Read, Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        assert!(reactor.cancel_event(a, IoEvent::Read));
        assert!(!reactor.cancel_event(a, IoEvent::Read));

        assert!(wait_for(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(reactor.pending_events(), 0);

        reactor.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_del_event_fires_nothing() {
        let reactor = Reactor::new(1, false, "r-del").unwrap();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        reactor
            .add_event(a, IoEvent::Read, Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        assert!(reactor.del_event(a, IoEvent::Read));
        assert_eq!(reactor.pending_events(), 0);

        unsafe { libc::write(b, b"x".as_ptr() as *const libc::c_void, 1) };
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        reactor.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_cancel_all_fires_parked_read() {
        let reactor = Reactor::new(1, false, "r-cancel-all").unwrap();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        reactor
            .add_event(a, IoEvent::Read, Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        assert!(reactor.cancel_all(a));
        assert!(!reactor.cancel_all(a));

        assert!(wait_for(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(reactor.pending_events(), 0);

        reactor.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_timer_fires_through_scheduler() {
        let reactor = Reactor::new(1, false, "r-timer").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        reactor.add_timer(50, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, false);

        assert!(wait_for(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 1
        }));
        reactor.stop();
    }

    #[test]
    fn test_stop_waits_for_outstanding_timer() {
        let reactor = Reactor::new(1, false, "r-stop-timer").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let start = Instant::now();
        reactor.add_timer(150, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, false);

        reactor.stop();
        assert!(start.elapsed() >= Duration::from_millis(140));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
