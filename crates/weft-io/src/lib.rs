//! # weft-io — readiness reactor and syscall hooks
//!
//! The I/O side of the weft runtime:
//!
//! - [`reactor`] — the epoll-backed extension of the scheduler that
//!   parks fibers on (fd, event) readiness and timer deadlines
//! - [`fdtable`] — per-fd metadata the hook layer consults
//! - [`hook`] — blocking-style wrappers over the POSIX I/O surface that
//!   suspend the calling fiber instead of the thread
//! - [`raw`] — the once-resolved next-in-load-order syscall entry points
//! - [`errno`] — errno plumbing for the wrappers

pub mod errno;
pub mod fdtable;
pub mod hook;
pub mod raw;
pub mod reactor;

pub use fdtable::{fd_table, FdContext, FdTable, TimeoutKind, INFINITE};
pub use reactor::{IoEvent, Reactor};
