//! Blocking-syscall hooks
//!
//! Drop-in forms of the blocking POSIX I/O surface. Signatures and
//! errno semantics match the kernel originals; the difference is that
//! when the per-thread hook flag is up (worker loops raise it) and the
//! fd is a socket the *user* left in blocking mode, a would-block turns
//! into a suspension of the calling fiber instead of a blocked thread.
//! The fiber parks on (fd, event) in the reactor, optionally guarded by
//! a condition timer carrying the fd's SO_RCVTIMEO/SO_SNDTIMEO budget,
//! and retries the raw call once readiness or cancellation wakes it.
//!
//! With the hook flag down, every function forwards straight to the raw
//! symbol table ([`crate::raw`]). None of these functions ever panic
//! across the boundary; failures come back as -1 with errno set.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use libc::{
    c_int, c_long, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t,
    timespec,
};

use weft_core::hook_flag;
use weft_core::werror;
use weft_runtime::scheduler::Task;
use weft_runtime::{config, Cond, Fiber};

use crate::errno::{errno, set_errno};
use crate::fdtable::{fd_table, TimeoutKind, INFINITE};
use crate::raw::raw;
use crate::reactor::{IoEvent, Reactor};

pub use weft_core::hook_flag::{is_enabled, set_enabled};

/// Shared flag between a parked I/O call and its timeout timer. The
/// timer stores the errno it wants the call to fail with; a cookie that
/// was dropped (call already resumed and returned) makes the timer a
/// no-op through the weak condition handle.
struct TimeoutCookie {
    cancelled: AtomicI32,
}

impl TimeoutCookie {
    fn new() -> Arc<TimeoutCookie> {
        Arc::new(TimeoutCookie {
            cancelled: AtomicI32::new(0),
        })
    }

    fn value(&self) -> i32 {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Arm a condition timer that cancels (fd, event) after `timeout_ms`,
/// marking the cookie so the woken call reports ETIMEDOUT.
fn arm_io_timer(
    reactor: &Reactor,
    fd: c_int,
    event: IoEvent,
    timeout_ms: i64,
    cookie: &Arc<TimeoutCookie>,
) -> Option<weft_runtime::TimerHandle> {
    if timeout_ms == INFINITE {
        return None;
    }
    let weak = Arc::downgrade(cookie);
    let cookie_dyn: Arc<dyn std::any::Any + Send + Sync> = cookie.clone();
    let cond: Cond = Arc::downgrade(&cookie_dyn);
    let r = reactor.clone();
    Some(reactor.add_condition_timer(
        timeout_ms.max(0) as u64,
        move || {
            let Some(cookie) = weak.upgrade() else {
                return;
            };
            if cookie.value() != 0 {
                return;
            }
            cookie.cancelled.store(libc::ETIMEDOUT, Ordering::Relaxed);
            r.cancel_event(fd, event);
        },
        cond,
    ))
}

/// The shared shape of every hooked I/O call: retry on EINTR, forward
/// anything that is not a would-block, and otherwise park the calling
/// fiber on readiness plus the fd's timeout for this direction.
fn do_io<F>(
    fd: c_int,
    fun: F,
    hook_name: &'static str,
    event: IoEvent,
    timeout_kind: TimeoutKind,
) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !hook_flag::is_enabled() {
        return fun();
    }
    let Some(ctx) = fd_table().get(fd, false) else {
        return fun();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return fun();
    }

    let timeout_ms = ctx.timeout(timeout_kind);
    let cookie = TimeoutCookie::new();

    loop {
        let mut n = fun();
        while n == -1 && errno() == libc::EINTR {
            n = fun();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Would block: park this fiber until readiness or timeout.
        let Some(reactor) = Reactor::current() else {
            return n;
        };
        if !Fiber::in_worker_fiber() {
            return n;
        }

        let timer = arm_io_timer(&reactor, fd, event, timeout_ms, &cookie);
        match reactor.add_event(fd, event, None) {
            Err(e) => {
                werror!("{}: add_event(fd={}, {:?}) failed: {}", hook_name, fd, event, e);
                if let Some(t) = timer {
                    reactor.cancel_timer(t);
                }
                return -1;
            }
            Ok(()) => {
                Fiber::yield_hold();
                // Woken by readiness, by the timeout cancelling the
                // event, or by close-time cancel_all.
                if let Some(t) = timer {
                    reactor.cancel_timer(t);
                }
                let cancelled = cookie.value();
                if cancelled != 0 {
                    set_errno(cancelled);
                    return -1;
                }
                // A close-time cancel_all also lands here; the fd
                // number may already belong to someone else, so it must
                // not be retried.
                if ctx.is_closed() {
                    set_errno(libc::EBADF);
                    return -1;
                }
            }
        }
    }
}

// ── sleep family ──

/// Timer-park the current fiber for `ms`. False when the calling
/// context has no reactor or is not a worker fiber, in which case the
/// caller should fall back to a real sleep.
pub fn park_on_timer(ms: u64) -> bool {
    let Some(reactor) = Reactor::current() else {
        return false;
    };
    if !Fiber::in_worker_fiber() {
        return false;
    }
    let fiber = Fiber::current();
    let sched = reactor.scheduler().clone();
    reactor.add_timer(
        ms,
        move || {
            sched.schedule(Task::from_fiber(fiber.clone()));
        },
        false,
    );
    Fiber::yield_hold();
    true
}

pub fn sleep(seconds: c_uint) -> c_uint {
    if hook_flag::is_enabled() && park_on_timer(seconds as u64 * 1000) {
        return 0;
    }
    unsafe { (raw().sleep)(seconds) }
}

pub fn usleep(usec: c_uint) -> c_int {
    if hook_flag::is_enabled() && park_on_timer(usec as u64 / 1000) {
        return 0;
    }
    unsafe { (raw().usleep)(usec) }
}

/// # Safety
/// `req` must point to a valid timespec; `rem`, if non-null, likewise.
pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if hook_flag::is_enabled() && !req.is_null() {
        let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
        if park_on_timer(ms) {
            return 0;
        }
    }
    (raw().nanosleep)(req, rem)
}

// ── socket lifecycle ──

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { (raw().socket)(domain, ty, protocol) };
    if fd == -1 || !hook_flag::is_enabled() {
        return fd;
    }
    // Register right away so connect/setsockopt find the context.
    fd_table().get(fd, true);
    fd
}

/// `connect` with an explicit budget; [`INFINITE`] blocks indefinitely.
///
/// # Safety
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: i64,
) -> c_int {
    if !hook_flag::is_enabled() {
        return (raw().connect)(fd, addr, addrlen);
    }
    let Some(ctx) = fd_table().get(fd, false) else {
        return (raw().connect)(fd, addr, addrlen);
    };
    if ctx.is_closed() || !ctx.is_socket() || ctx.user_nonblock() {
        return (raw().connect)(fd, addr, addrlen);
    }

    let n = (raw().connect)(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(reactor) = Reactor::current() else {
        return n;
    };
    if !Fiber::in_worker_fiber() {
        return n;
    }

    let cookie = TimeoutCookie::new();
    let timer = arm_io_timer(&reactor, fd, IoEvent::Write, timeout_ms, &cookie);

    match reactor.add_event(fd, IoEvent::Write, None) {
        Ok(()) => {
            Fiber::yield_hold();
            if let Some(t) = timer {
                reactor.cancel_timer(t);
            }
            let cancelled = cookie.value();
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
            if ctx.is_closed() {
                set_errno(libc::EBADF);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = timer {
                reactor.cancel_timer(t);
            }
            werror!("connect: add_event(fd={}, WRITE) failed: {}", fd, e);
        }
    }

    // The write edge only says the attempt finished; SO_ERROR says how.
    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if (raw().getsockopt)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// # Safety
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    // A send timeout set on the fd is authoritative; the process-wide
    // connect timeout only fills in when none is.
    let timeout_ms = fd_table()
        .get(fd, false)
        .map(|ctx| ctx.timeout(TimeoutKind::Send))
        .filter(|t| *t != INFINITE)
        .unwrap_or(config().connect_timeout_ms as i64);
    connect_with_timeout(fd, addr, addrlen, timeout_ms)
}

/// # Safety
/// `addr`/`addrlen` follow the accept(2) contract.
pub unsafe fn accept(s: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(
        s,
        || (raw().accept)(s, addr, addrlen) as ssize_t,
        "accept",
        IoEvent::Read,
        TimeoutKind::Recv,
    ) as c_int;

    if fd >= 0 && hook_flag::is_enabled() {
        if let Some(ctx) = fd_table().get(fd, true) {
            // Accepted connections start with the configured server-side
            // read budget unless someone already set one.
            let default_ms = config().accept_read_timeout_ms;
            if default_ms != INFINITE && ctx.timeout(TimeoutKind::Recv) == INFINITE {
                ctx.set_timeout(TimeoutKind::Recv, default_ms);
            }
        }
    }
    fd
}

// ── generic I/O ──

/// # Safety
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, || (raw().read)(fd, buf, count), "read", IoEvent::Read, TimeoutKind::Recv)
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, || (raw().readv)(fd, iov, iovcnt), "readv", IoEvent::Read, TimeoutKind::Recv)
}

/// # Safety
/// `buf` must be valid for writes of `len` bytes.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, || (raw().recv)(fd, buf, len, flags), "recv", IoEvent::Read, TimeoutKind::Recv)
}

/// # Safety
/// Pointers follow the recvfrom(2) contract.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(
        fd,
        || (raw().recvfrom)(fd, buf, len, flags, src_addr, addrlen),
        "recvfrom",
        IoEvent::Read,
        TimeoutKind::Recv,
    )
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(fd, || (raw().recvmsg)(fd, msg, flags), "recvmsg", IoEvent::Read, TimeoutKind::Recv)
}

/// # Safety
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, || (raw().write)(fd, buf, count), "write", IoEvent::Write, TimeoutKind::Send)
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, || (raw().writev)(fd, iov, iovcnt), "writev", IoEvent::Write, TimeoutKind::Send)
}

/// # Safety
/// `msg` must be valid for reads of `len` bytes.
pub unsafe fn send(fd: c_int, msg: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, || (raw().send)(fd, msg, len, flags), "send", IoEvent::Write, TimeoutKind::Send)
}

/// # Safety
/// Pointers follow the sendto(2) contract.
pub unsafe fn sendto(
    fd: c_int,
    msg: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(
        fd,
        || (raw().sendto)(fd, msg, len, flags, to, tolen),
        "sendto",
        IoEvent::Write,
        TimeoutKind::Send,
    )
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(fd, || (raw().sendmsg)(fd, msg, flags), "sendmsg", IoEvent::Write, TimeoutKind::Send)
}

// ── teardown and fd control ──

pub fn close(fd: c_int) -> c_int {
    if !hook_flag::is_enabled() {
        return unsafe { (raw().close)(fd) };
    }
    if let Some(ctx) = fd_table().get(fd, false) {
        ctx.set_closed();
        // Nothing may stay parked on a dead descriptor.
        if let Some(reactor) = Reactor::current() {
            reactor.cancel_all(fd);
        }
        fd_table().del(fd);
    }
    unsafe { (raw().close)(fd) }
}

/// fcntl with the F_SETFL/F_GETFL translation: the context records what
/// the user asked for, the kernel keeps the runtime-imposed O_NONBLOCK,
/// and F_GETFL presents the user's view with that bit hidden.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let forward = |arg: c_long| unsafe { libc::fcntl(fd, cmd, arg) };
            let Some(ctx) = fd_table().get(fd, false) else {
                return forward(arg);
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return forward(arg);
            }
            let mut flags = arg as c_int;
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            forward(flags as c_long)
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags == -1 {
                return flags;
            }
            let Some(ctx) = fd_table().get(fd, false) else {
                return flags;
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return flags;
            }
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// ioctl with FIONBIO mirrored into the fd context.
///
/// # Safety
/// `arg` must follow the ioctl(2) contract for `request`; for FIONBIO
/// it must point to a c_int.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO && !arg.is_null() {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = fd_table().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
/// Pointers follow the getsockopt(2) contract.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    (raw().getsockopt)(fd, level, optname, optval, optlen)
}

/// setsockopt with SO_RCVTIMEO/SO_SNDTIMEO captured into the fd
/// context (in ms) so the hook layer can honor them without a kernel
/// round trip.
///
/// # Safety
/// `optval` must be valid for reads of `optlen` bytes; for the timeout
/// options it must point to a timeval.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_flag::is_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
    {
        if let Some(ctx) = fd_table().get(fd, true) {
            let tv = &*(optval as *const libc::timeval);
            let mut ms = tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000;
            // A zero timeval disables the timeout.
            if ms == 0 {
                ms = INFINITE;
            }
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
        }
    }
    (raw().setsockopt)(fd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::RawFd;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rt = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_disabled_hook_forwards() {
        set_enabled(false);
        let (a, b) = socketpair();

        let msg = b"plain";
        let n = unsafe { write(b, msg.as_ptr() as *const c_void, msg.len()) };
        assert_eq!(n, 5);

        let mut buf = [0u8; 16];
        let n = unsafe { read(a, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], msg);

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_immediate_data_returns_without_parking() {
        // Hook enabled, context present, data already queued: the call
        // must complete on the first raw attempt even with no reactor.
        let (a, b) = socketpair();
        fd_table().get(a, true).unwrap();
        set_enabled(true);

        unsafe { libc::write(b, b"now".as_ptr() as *const c_void, 3) };
        let mut buf = [0u8; 8];
        let n = unsafe { read(a, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"now");

        set_enabled(false);
        fd_table().del(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_fcntl_hides_forced_nonblock() {
        let (a, b) = socketpair();
        let ctx = fd_table().get(a, true).unwrap();
        assert!(ctx.sys_nonblock());

        // Kernel fd is non-blocking, user never asked: hidden.
        let flags = fcntl(a, libc::F_GETFL, 0);
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        // User opts in: recorded and visible again.
        let rt = fcntl(a, libc::F_SETFL, (flags | libc::O_NONBLOCK) as c_long);
        assert_eq!(rt, 0);
        assert!(ctx.user_nonblock());
        let flags = fcntl(a, libc::F_GETFL, 0);
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        // And back out: the kernel keeps O_NONBLOCK regardless.
        let rt = fcntl(a, libc::F_SETFL, (flags & !libc::O_NONBLOCK) as c_long);
        assert_eq!(rt, 0);
        assert!(!ctx.user_nonblock());
        let kernel_flags = unsafe { libc::fcntl(a, libc::F_GETFL, 0) };
        assert_ne!(kernel_flags & libc::O_NONBLOCK, 0);

        fd_table().del(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_ioctl_fionbio_mirrors_user_intent() {
        let (a, b) = socketpair();
        let ctx = fd_table().get(a, true).unwrap();

        let mut on: c_int = 1;
        let rt = unsafe { ioctl(a, libc::FIONBIO, &mut on as *mut c_int as *mut c_void) };
        assert_eq!(rt, 0);
        assert!(ctx.user_nonblock());

        let mut off: c_int = 0;
        unsafe { ioctl(a, libc::FIONBIO, &mut off as *mut c_int as *mut c_void) };
        assert!(!ctx.user_nonblock());

        fd_table().del(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_setsockopt_records_timeouts() {
        let (a, b) = socketpair();
        set_enabled(true);

        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 250_000,
        };
        let rt = unsafe {
            setsockopt(
                a,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        assert_eq!(rt, 0);
        set_enabled(false);

        let ctx = fd_table().get(a, false).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 1250);
        assert_eq!(ctx.timeout(TimeoutKind::Send), INFINITE);

        fd_table().del(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_close_drops_context() {
        let (a, b) = socketpair();
        fd_table().get(a, true).unwrap();
        set_enabled(true);
        let rt = close(a);
        set_enabled(false);
        assert_eq!(rt, 0);
        assert!(fd_table().get(a, false).is_none());

        unsafe { libc::close(b) };
    }

    #[test]
    fn test_user_nonblock_bypasses_parking() {
        // With user_nonblock set, a would-block comes straight back as
        // EAGAIN even though the hook is on.
        let (a, b) = socketpair();
        let ctx = fd_table().get(a, true).unwrap();
        ctx.set_user_nonblock(true);
        set_enabled(true);

        let mut buf = [0u8; 8];
        let n = unsafe { read(a, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, -1);
        assert_eq!(errno(), libc::EAGAIN);

        set_enabled(false);
        fd_table().del(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
