//! OS thread identity
//!
//! Task affinity is expressed in kernel thread ids, so both the
//! scheduler and its users need the same notion of "this thread".

use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<i64> = const { Cell::new(-1) };
}

/// Kernel thread id of the calling thread.
///
/// Cached per thread; the first call issues `gettid(2)`.
#[inline]
pub fn os_tid() -> i64 {
    CACHED_TID.with(|cell| {
        let mut tid = cell.get();
        if tid == -1 {
            tid = unsafe { libc::syscall(libc::SYS_gettid) as i64 };
            cell.set(tid);
        }
        tid
    })
}
