//! Raw syscall entry points
//!
//! The hook layer forwards to the *next* definition of each name in
//! load order, resolved once through `dlsym(RTLD_NEXT, ..)` and cached
//! for the lifetime of the process. In the common case that is the libc
//! symbol itself; under another interposer it is whatever comes next.
//! Resolution happens before the first fiber runs a hooked call, so the
//! lookup never races a suspension.
//!
//! `fcntl` and `ioctl` are C-variadic and cannot be stored behind a
//! fixed-arity function pointer; their raw forms go through the libc
//! bindings directly.

use std::ffi::CStr;
use std::sync::OnceLock;

use libc::{
    c_char, c_int, c_uint, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec,
};

type SleepFn = unsafe extern "C" fn(c_uint) -> c_uint;
type UsleepFn = unsafe extern "C" fn(c_uint) -> c_int;
type NanosleepFn = unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int;
type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
type ReadvFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
type RecvfromFn = unsafe extern "C" fn(
    c_int,
    *mut c_void,
    size_t,
    c_int,
    *mut sockaddr,
    *mut socklen_t,
) -> ssize_t;
type RecvmsgFn = unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t;
type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
type WritevFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
type SendtoFn = unsafe extern "C" fn(
    c_int,
    *const c_void,
    size_t,
    c_int,
    *const sockaddr,
    socklen_t,
) -> ssize_t;
type SendmsgFn = unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type GetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
type SetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;

/// Cached next-in-load-order entry points for every hooked name.
pub struct RawApi {
    pub sleep: SleepFn,
    pub usleep: UsleepFn,
    pub nanosleep: NanosleepFn,
    pub socket: SocketFn,
    pub connect: ConnectFn,
    pub accept: AcceptFn,
    pub read: ReadFn,
    pub readv: ReadvFn,
    pub recv: RecvFn,
    pub recvfrom: RecvfromFn,
    pub recvmsg: RecvmsgFn,
    pub write: WriteFn,
    pub writev: WritevFn,
    pub send: SendFn,
    pub sendto: SendtoFn,
    pub sendmsg: SendmsgFn,
    pub close: CloseFn,
    pub getsockopt: GetsockoptFn,
    pub setsockopt: SetsockoptFn,
}

/// Address of the next definition of `name`, or `fallback` (the libc
/// binding) when the lookup comes back empty.
fn next_symbol(name: &'static CStr, fallback: usize) -> usize {
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) };
    if addr.is_null() {
        fallback
    } else {
        addr as usize
    }
}

macro_rules! resolve {
    ($name:literal, $fallback:path, $ty:ty) => {{
        let addr = next_symbol($name, $fallback as usize);
        // Safety: the symbol has the prototype named by $ty in every
        // libc this crate targets.
        unsafe { std::mem::transmute::<usize, $ty>(addr) }
    }};
}

static RAW: OnceLock<RawApi> = OnceLock::new();

/// The resolved raw-symbol table.
pub fn raw() -> &'static RawApi {
    RAW.get_or_init(|| RawApi {
        sleep: resolve!(c"sleep", libc::sleep, SleepFn),
        usleep: resolve!(c"usleep", libc::usleep, UsleepFn),
        nanosleep: resolve!(c"nanosleep", libc::nanosleep, NanosleepFn),
        socket: resolve!(c"socket", libc::socket, SocketFn),
        connect: resolve!(c"connect", libc::connect, ConnectFn),
        accept: resolve!(c"accept", libc::accept, AcceptFn),
        read: resolve!(c"read", libc::read, ReadFn),
        readv: resolve!(c"readv", libc::readv, ReadvFn),
        recv: resolve!(c"recv", libc::recv, RecvFn),
        recvfrom: resolve!(c"recvfrom", libc::recvfrom, RecvfromFn),
        recvmsg: resolve!(c"recvmsg", libc::recvmsg, RecvmsgFn),
        write: resolve!(c"write", libc::write, WriteFn),
        writev: resolve!(c"writev", libc::writev, WritevFn),
        send: resolve!(c"send", libc::send, SendFn),
        sendto: resolve!(c"sendto", libc::sendto, SendtoFn),
        sendmsg: resolve!(c"sendmsg", libc::sendmsg, SendmsgFn),
        close: resolve!(c"close", libc::close, CloseFn),
        getsockopt: resolve!(c"getsockopt", libc::getsockopt, GetsockoptFn),
        setsockopt: resolve!(c"setsockopt", libc::setsockopt, SetsockoptFn),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_round_trip() {
        // A write through the resolved table must behave like the libc
        // call it stands in for.
        let api = raw();
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let msg = b"raw";
        let n = unsafe { (api.write)(fds[1], msg.as_ptr() as *const c_void, msg.len()) };
        assert_eq!(n, 3);

        let mut buf = [0u8; 8];
        let n = unsafe { (api.read)(fds[0], buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], msg);

        unsafe {
            (api.close)(fds[0]);
            (api.close)(fds[1]);
        }
    }

    #[test]
    fn test_table_is_cached() {
        let a = raw() as *const RawApi;
        let b = raw() as *const RawApi;
        assert_eq!(a, b);
    }
}
