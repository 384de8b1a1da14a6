//! # weft — a cooperative fiber runtime
//!
//! Many fibers, few threads. Application code writes ordinary blocking
//! socket calls; the runtime turns every would-block into a suspension
//! of the calling fiber, parks it on epoll readiness and a timer, and
//! multiplexes the worker pool across everything else in the meantime.
//!
//! ## Quick start
//!
//! ```ignore
//! use weft::{Reactor, spawn, sleep_ms};
//!
//! fn main() {
//!     let reactor = Reactor::new(4, false, "app").unwrap();
//!
//!     for i in 0..100 {
//!         spawn(move || {
//!             // Looks blocking; parks the fiber, not the thread.
//!             sleep_ms(250);
//!             println!("fiber {} woke up", i);
//!         }).unwrap();
//!     }
//!
//!     reactor.stop();
//! }
//! ```
//!
//! Inside a fiber, the wrappers in [`hook`] (`read`, `write`,
//! `connect`, `accept`, ...) behave like their POSIX namesakes with
//! identical errno semantics, cooperatively suspending instead of
//! blocking the worker thread.

use std::time::Duration;

// Core types
pub use weft_core::{os_tid, FiberId, FiberState, LogLevel, WeftError, WeftResult};

// Logging macros
pub use weft_core::{wdebug, werror, winfo, wtrace, wwarn};

// Runtime
pub use weft_runtime::{
    config, now_ms, set_config, Fiber, RuntimeConfig, Scheduler, Task, TimerHandle, ANY_WORKER,
};

// I/O
pub use weft_io::hook;
pub use weft_io::{fd_table, FdContext, IoEvent, Reactor, TimeoutKind};

/// Spawn a task onto the current thread's reactor (or bare scheduler).
/// Never blocks the caller.
pub fn spawn<F>(f: F) -> WeftResult<()>
where
    F: FnOnce() + Send + 'static,
{
    spawn_task(Task::from_fn(f))
}

/// Spawn a task pinned to the worker with the given kernel thread id.
pub fn spawn_to<F>(f: F, tid: i64) -> WeftResult<()>
where
    F: FnOnce() + Send + 'static,
{
    spawn_task(Task::from_fn(f).with_thread(tid))
}

fn spawn_task(task: Task) -> WeftResult<()> {
    if let Some(reactor) = Reactor::current() {
        reactor.schedule(task);
        return Ok(());
    }
    if let Some(sched) = Scheduler::current() {
        sched.schedule(task);
        return Ok(());
    }
    Err(WeftError::NoScheduler)
}

/// Sleep cooperatively: inside a worker fiber this parks the fiber on a
/// timer; anywhere else it falls back to a thread sleep.
pub fn sleep_ms(ms: u64) {
    if !hook::park_on_timer(ms) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Give other fibers a turn. Inside a worker fiber the current fiber
/// re-enters the run queue; elsewhere the OS thread yields.
pub fn yield_now() {
    if Fiber::in_worker_fiber() {
        Fiber::yield_ready();
    } else {
        std::thread::yield_now();
    }
}
