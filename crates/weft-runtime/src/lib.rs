//! # weft-runtime — fibers, scheduler, timers
//!
//! The execution core of the weft runtime:
//!
//! - [`fiber`] — stackful coroutines with guarded mmap stacks and
//!   hand-written context switching ([`arch`], [`stack`])
//! - [`scheduler`] — the N:M worker pool draining a shared task FIFO
//! - [`timer`] — the absolute-deadline timer wheel
//! - [`config`] — process-wide runtime knobs
//!
//! The I/O reactor and the syscall hooks build on this crate from
//! `weft-io`; nothing here touches sockets.

pub mod arch;
pub mod config;
pub mod fiber;
pub mod scheduler;
pub mod stack;
pub mod timer;

pub use config::{config, set_config, RuntimeConfig};
pub use fiber::Fiber;
pub use scheduler::{Driver, Scheduler, Task, TaskFn, WeakScheduler, ANY_WORKER};
pub use timer::{now_ms, Cond, TimerCallback, TimerHandle, TimerWheel};
