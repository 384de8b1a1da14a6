//! N:M fiber scheduler
//!
//! A fixed pool of OS workers drains a shared FIFO of tasks. A task is
//! either a fiber to resume or a bare closure, optionally pinned to one
//! worker's kernel thread id. Each worker runs the same loop: claim the
//! first admissible task, resume it, and fall back to the per-worker
//! idle fiber when the queue has nothing for it.
//!
//! The reactor layers itself on top through the [`Driver`] trait: it
//! replaces the no-op `tickle` with a self-pipe write, the idle fiber
//! body with an epoll wait, and extends the stop condition. Without a
//! driver the scheduler behaves as a plain thread-pool executor.
//!
//! With `use_caller` the constructing thread is co-opted as one of the
//! workers: its scheduling fiber is a child of its main fiber, created
//! up front but only entered when `stop()` drains the queue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock};

use weft_core::error::{WeftError, WeftResult};
use weft_core::{hook_flag, os_tid, FiberState};
use weft_core::{werror, winfo};

use crate::config;
use crate::fiber::Fiber;

/// Boxed task body.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Run anywhere, rather than pinned to one worker.
pub const ANY_WORKER: i64 = -1;

/// One queue entry: a fiber or a closure, plus a worker affinity
/// expressed as a kernel thread id (`ANY_WORKER` for none).
pub struct Task {
    fiber: Option<Arc<Fiber>>,
    callback: Option<TaskFn>,
    thread: i64,
}

impl Task {
    /// Task that resumes an existing fiber.
    pub fn from_fiber(fiber: Arc<Fiber>) -> Self {
        Task {
            fiber: Some(fiber),
            callback: None,
            thread: ANY_WORKER,
        }
    }

    /// Task that runs a closure inside a (pooled) fiber.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            fiber: None,
            callback: Some(Box::new(f)),
            thread: ANY_WORKER,
        }
    }

    /// Pin this task to the worker with the given kernel thread id.
    pub fn with_thread(mut self, tid: i64) -> Self {
        self.thread = tid;
        self
    }
}

/// Behavior the reactor injects into the worker loop. The base
/// scheduler uses built-in no-op equivalents when none is installed.
pub trait Driver: Send + Sync + 'static {
    /// Called once per worker thread before its loop starts.
    fn on_thread_start(&self) {}

    /// Wake an idle worker after new work was admitted.
    fn tickle(&self);

    /// Body of the per-worker idle fiber. Must keep yielding with
    /// [`Fiber::yield_hold`] until [`Driver::stopping`] holds, then
    /// return; returning terminates the worker.
    fn idle(&self);

    /// Whether the scheduler may shut down.
    fn stopping(&self) -> bool;
}

pub(crate) struct SchedulerCore {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    /// OS threads spawned by `start()` (excludes a caller worker).
    thread_count: usize,
    use_caller: bool,
    /// Kernel tid of the caller worker, or -1.
    root_thread: i64,
    /// Scheduling fiber of the caller worker; entered during `stop()`.
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<i64>>,
    started_cv: Condvar,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    started: AtomicBool,
    stop_requested: AtomicBool,
    driver: RwLock<Option<Arc<dyn Driver>>>,
}

impl SchedulerCore {
    fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.driver.read().clone()
    }

    pub(crate) fn enqueue(&self, task: Task) {
        let need_tickle = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn enqueue_all(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let need_tickle = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            q.extend(tasks);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    pub(crate) fn tickle(&self) {
        match self.driver() {
            Some(d) => d.tickle(),
            None => winfo!("scheduler {}: tickle", self.name),
        }
    }

    /// Stop condition of the bare scheduler: stop was requested, the
    /// queue is drained, and no worker is mid-task.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active_count.load(Ordering::Acquire) == 0
    }

    fn stopping(&self) -> bool {
        match self.driver() {
            Some(d) => d.stopping(),
            None => self.base_stopping(),
        }
    }
}

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// Handle to a scheduler; clones share the same pool.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// Build a scheduler with `worker_count` workers (0 means the
    /// configured default). With `use_caller` the calling thread counts
    /// as one of them and participates in draining during `stop()`.
    pub fn new(worker_count: usize, use_caller: bool, name: &str) -> WeftResult<Scheduler> {
        let total = if worker_count == 0 {
            config::config().default_workers
        } else {
            worker_count
        };
        if use_caller && total == 0 {
            return Err(WeftError::Config("worker_count must be > 0"));
        }
        let thread_count = if use_caller { total - 1 } else { total };

        let core = Arc::new(SchedulerCore {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            thread_count,
            use_caller,
            root_thread: if use_caller { os_tid() } else { -1 },
            root_fiber: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            started_cv: Condvar::new(),
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            driver: RwLock::new(None),
        });

        let sched = Scheduler { core };
        if use_caller {
            // The caller's main fiber stays in control; its scheduling
            // fiber is a child entered when stop() drains the queue.
            Fiber::current();
            let core = sched.core.clone();
            let root = Fiber::new(move || run_worker(core), 0)?;
            *sched.core.root_fiber.lock() = Some(root);
            sched.core.thread_ids.lock().push(os_tid());
            set_current_scheduler(Some(sched.clone()));
        }
        Ok(sched)
    }

    /// Scheduler the current thread belongs to, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHED.with(|c| c.borrow().clone())
    }

    /// Install the reactor-side behavior. Must happen before `start()`.
    pub fn set_driver(&self, driver: Arc<dyn Driver>) {
        *self.core.driver.write() = Some(driver);
    }

    /// Spawn the worker threads. Returns once every worker is up and
    /// registered, so `thread_ids()` is complete afterwards.
    pub fn start(&self) -> WeftResult<()> {
        if self.core.started.swap(true, Ordering::SeqCst) {
            return Err(WeftError::AlreadyStarted);
        }

        for i in 0..self.core.thread_count {
            let core = self.core.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.core.name, i))
                .spawn(move || {
                    {
                        let mut ids = core.thread_ids.lock();
                        ids.push(os_tid());
                        core.started_cv.notify_all();
                    }
                    run_worker(core);
                })
                .map_err(|_| WeftError::Os {
                    call: "thread spawn",
                    errno: libc::EAGAIN,
                })?;
            self.core.threads.lock().push(handle);
        }

        let expected = self.core.thread_count + usize::from(self.core.use_caller);
        let mut ids = self.core.thread_ids.lock();
        while ids.len() < expected {
            self.core.started_cv.wait(&mut ids);
        }
        Ok(())
    }

    /// Request shutdown and wait for every worker to finish the queue.
    /// Idempotent; with `use_caller` it must run on the owning thread,
    /// which drains its own share of the queue before returning.
    pub fn stop(&self) {
        self.core.stop_requested.store(true, Ordering::Release);
        for _ in 0..self.core.thread_count {
            self.core.tickle();
        }

        let root = self.core.root_fiber.lock().clone();
        if let Some(root) = root {
            // One extra poke for the caller worker.
            self.core.tickle();
            if os_tid() == self.core.root_thread {
                if root.state().is_resumable() && !self.core.stopping() {
                    root.resume();
                }
            } else {
                werror!(
                    "scheduler {}: stop() off the owning thread; caller worker not drained",
                    self.core.name
                );
            }
        }

        let handles: Vec<_> = {
            let mut threads = self.core.threads.lock();
            threads.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Admit a task. Never blocks; wakes an idle worker when the queue
    /// transitions from empty.
    pub fn schedule(&self, task: Task) {
        self.core.enqueue(task);
    }

    /// Bulk admission with a single wakeup.
    pub fn schedule_all(&self, tasks: Vec<Task>) {
        self.core.enqueue_all(tasks);
    }

    /// Whether shutdown has been requested and all work is drained.
    pub fn stopping(&self) -> bool {
        self.core.stopping()
    }

    /// The bare-scheduler part of the stop condition, for drivers that
    /// extend it.
    pub fn base_stopping(&self) -> bool {
        self.core.base_stopping()
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Total workers, the caller worker included.
    pub fn worker_count(&self) -> usize {
        self.core.thread_count + usize::from(self.core.use_caller)
    }

    /// Kernel thread ids of all workers; complete after `start()`.
    pub fn thread_ids(&self) -> Vec<i64> {
        self.core.thread_ids.lock().clone()
    }

    /// Workers currently resuming a task.
    pub fn active_count(&self) -> usize {
        self.core.active_count.load(Ordering::Acquire)
    }

    /// Workers currently parked in their idle fiber.
    pub fn idle_count(&self) -> usize {
        self.core.idle_count.load(Ordering::Acquire)
    }

    /// Whether any worker would notice a tickle right now.
    pub fn has_idle_workers(&self) -> bool {
        self.idle_count() > 0
    }

    pub(crate) fn from_core(core: Arc<SchedulerCore>) -> Scheduler {
        Scheduler { core }
    }

    /// Non-owning handle, so a driver can refer back to its scheduler
    /// without keeping the pool alive.
    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            core: Arc::downgrade(&self.core),
        }
    }
}

/// Weak counterpart of [`Scheduler`].
#[derive(Clone)]
pub struct WeakScheduler {
    core: std::sync::Weak<SchedulerCore>,
}

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.core.upgrade().map(Scheduler::from_core)
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Scheduler name={} workers={} active={} idle={} stop_requested={}] threads={:?}",
            self.core.name,
            self.worker_count(),
            self.active_count(),
            self.idle_count(),
            self.core.stop_requested.load(Ordering::Relaxed),
            self.thread_ids(),
        )
    }
}

fn set_current_scheduler(sched: Option<Scheduler>) {
    CURRENT_SCHED.with(|c| *c.borrow_mut() = sched);
}

/// The scheduling loop. Runs on each spawned worker's main fiber and,
/// for `use_caller`, inside the root fiber on the constructing thread.
fn run_worker(core: Arc<SchedulerCore>) {
    hook_flag::set_enabled(true);
    set_current_scheduler(Some(Scheduler::from_core(core.clone())));
    let driver = core.driver();
    if let Some(d) = &driver {
        d.on_thread_start();
    }
    Fiber::current();
    let my_tid = os_tid();

    let idle_core = core.clone();
    let idle_fiber = match Fiber::new(move || idle_entry(idle_core), 0) {
        Ok(f) => f,
        Err(e) => {
            werror!("scheduler {}: idle fiber allocation failed: {}", core.name, e);
            return;
        }
    };

    // Reusable fiber for bare-closure tasks.
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut tickle_me = false;
        let mut task: Option<Task> = None;
        {
            let mut q = core.queue.lock();
            let mut idx = 0;
            while idx < q.len() {
                let t = &q[idx];
                // Pinned to some other worker: leave it, poke someone.
                if t.thread != ANY_WORKER && t.thread != my_tid {
                    tickle_me = true;
                    idx += 1;
                    continue;
                }
                // A fiber that has not finished yielding yet (it was
                // woken between registering its wakeup and suspending):
                // not resumable until its state settles.
                if let Some(f) = &t.fiber {
                    if f.state() == FiberState::Exec {
                        idx += 1;
                        continue;
                    }
                }
                task = q.remove(idx);
                core.active_count.fetch_add(1, Ordering::SeqCst);
                break;
            }
            tickle_me = tickle_me || (task.is_some() && !q.is_empty());
        }
        if tickle_me {
            core.tickle();
        }

        match task {
            Some(Task {
                fiber: Some(fiber), ..
            }) => {
                if fiber.state().is_terminal() {
                    core.active_count.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
                fiber.clone().resume();
                core.active_count.fetch_sub(1, Ordering::SeqCst);
                match fiber.state() {
                    FiberState::Ready => core.enqueue(Task::from_fiber(fiber)),
                    s if !s.is_terminal() => fiber.set_state(FiberState::Hold),
                    _ => {}
                }
            }
            Some(Task {
                callback: Some(cb), ..
            }) => {
                let fiber = match cb_fiber.take() {
                    Some(f) => {
                        f.reset(move || cb());
                        f
                    }
                    None => match Fiber::new(move || cb(), 0) {
                        Ok(f) => f,
                        Err(e) => {
                            werror!("scheduler {}: task fiber allocation failed: {}", core.name, e);
                            core.active_count.fetch_sub(1, Ordering::SeqCst);
                            continue;
                        }
                    },
                };
                fiber.clone().resume();
                core.active_count.fetch_sub(1, Ordering::SeqCst);
                match fiber.state() {
                    FiberState::Ready => core.enqueue(Task::from_fiber(fiber)),
                    FiberState::Term | FiberState::Except => cb_fiber = Some(fiber),
                    _ => fiber.set_state(FiberState::Hold),
                }
            }
            Some(_) => {
                core.active_count.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if idle_fiber.state().is_terminal() {
                    winfo!("scheduler {}: idle fiber terminated, worker exiting", core.name);
                    break;
                }
                core.idle_count.fetch_add(1, Ordering::SeqCst);
                idle_fiber.clone().resume();
                core.idle_count.fetch_sub(1, Ordering::SeqCst);
                if !idle_fiber.state().is_terminal() {
                    idle_fiber.set_state(FiberState::Hold);
                }
            }
        }
    }

    set_current_scheduler(None);
}

/// Idle fiber entry: the driver's wait loop, or the built-in
/// yield-until-stopping fallback.
fn idle_entry(core: Arc<SchedulerCore>) {
    match core.driver() {
        Some(d) => d.idle(),
        None => {
            winfo!("scheduler {}: idle", core.name);
            while !core.stopping() {
                Fiber::yield_hold();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_runs_closure_tasks() {
        let sched = Scheduler::new(2, false, "t-basic").unwrap();
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let h = hits.clone();
            sched.schedule(Task::from_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }

        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_runs_fiber_tasks_with_yield() {
        let sched = Scheduler::new(2, false, "t-fiber").unwrap();
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_ready();
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
        )
        .unwrap();
        sched.schedule(Task::from_fiber(fiber));

        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "t-caller").unwrap();
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let h = hits.clone();
            sched.schedule(Task::from_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // No spawned threads; everything runs when stop() enters the
        // caller's scheduling fiber.
        assert_eq!(sched.worker_count(), 1);
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_affinity_pins_to_worker() {
        let sched = Scheduler::new(3, false, "t-affinity").unwrap();
        sched.start().unwrap();

        let ids = sched.thread_ids();
        assert_eq!(ids.len(), 3);
        let target = ids[2];

        let observed = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..20 {
            let o = observed.clone();
            sched.schedule(
                Task::from_fn(move || {
                    o.lock().push(os_tid());
                })
                .with_thread(target),
            );
        }

        sched.stop();
        let observed = observed.lock();
        assert_eq!(observed.len(), 20);
        assert!(observed.iter().all(|tid| *tid == target));
    }

    #[test]
    fn test_fifo_order_single_worker() {
        let sched = Scheduler::new(1, false, "t-fifo").unwrap();
        sched.start().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..30 {
            let o = order.clone();
            sched.schedule(Task::from_fn(move || {
                o.lock().push(i);
            }));
        }

        sched.stop();
        let order = order.lock();
        assert_eq!(*order, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let sched = Scheduler::new(2, false, "t-stop").unwrap();
        sched.start().unwrap();
        sched.stop();
        sched.stop();
    }

    #[test]
    fn test_task_panic_does_not_kill_worker() {
        weft_core::wlog::set_log_level(weft_core::LogLevel::Off);
        let sched = Scheduler::new(1, false, "t-panic").unwrap();
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        sched.schedule(Task::from_fn(|| panic!("task failure")));
        let h = hits.clone();
        sched.schedule(Task::from_fn(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_enqueuers_preserve_per_thread_order() {
        let sched = Scheduler::new(1, false, "t-admission").unwrap();
        sched.start().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut producers = Vec::new();
        for p in 0..4u32 {
            let sched = sched.clone();
            let log = log.clone();
            producers.push(std::thread::spawn(move || {
                for seq in 0..25u32 {
                    let log = log.clone();
                    sched.schedule(Task::from_fn(move || {
                        log.lock().push((p, seq));
                    }));
                    std::thread::sleep(Duration::from_micros(100));
                }
            }));
        }
        for t in producers {
            t.join().unwrap();
        }

        sched.stop();
        let log = log.lock();
        assert_eq!(log.len(), 100);
        for p in 0..4u32 {
            let seqs: Vec<u32> = log.iter().filter(|(q, _)| *q == p).map(|(_, s)| *s).collect();
            assert_eq!(seqs, (0..25).collect::<Vec<_>>());
        }
    }
}
