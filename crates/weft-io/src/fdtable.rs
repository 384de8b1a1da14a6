//! File-descriptor context table
//!
//! The hook layer consults one [`FdContext`] per observed fd: whether it
//! is a socket, whether the *user* asked for non-blocking mode (distinct
//! from the non-blocking flag the runtime forces onto the kernel fd),
//! and the per-direction timeouts. Contexts are created lazily on first
//! observation and dropped when a `close` is seen.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// Which direction a timeout governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// SO_RCVTIMEO: read-side calls
    Recv,
    /// SO_SNDTIMEO: write-side calls and connect
    Send,
}

/// Timeout sentinel for "no timeout".
pub const INFINITE: i64 = -1;

/// Per-fd metadata.
///
/// `sys_nonblock` records that the runtime switched the kernel fd to
/// non-blocking; `user_nonblock` records what the application asked
/// for. The hook treats the fd as blocking (and parks fibers on it) as
/// long as the user never requested non-blocking mode, even though the
/// kernel side always is.
pub struct FdContext {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdContext {
    /// Probe the fd and build its context. Sockets are switched to
    /// kernel non-blocking mode here if they are not already.
    fn new(fd: RawFd) -> FdContext {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            // Raw fcntl: the hooked variant would consult this very
            // context while it is being built.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdContext {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(INFINITE),
            send_timeout_ms: AtomicI64::new(INFINITE),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, flag: bool) {
        self.user_nonblock.store(flag, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Timeout in ms for one direction; [`INFINITE`] when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> i64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: i64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

/// Sparse index fd -> context, grown by 1.5x on demand. Lookups take a
/// shared lock; only growth and insertion go exclusive.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Context for `fd`, materializing one when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read();
            if idx < slots.len() {
                if let Some(ctx) = &slots[idx] {
                    return Some(ctx.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write();
        if idx >= slots.len() {
            let new_len = ((idx + 1) * 3 / 2).max(slots.len());
            slots.resize(new_len, None);
        }
        // Another thread may have raced the upgrade.
        if let Some(ctx) = &slots[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdContext::new(fd));
        slots[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget `fd`; invoked when a close is observed.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write();
        if (fd as usize) < slots.len() {
            slots[fd as usize] = None;
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

static TABLE: OnceLock<FdTable> = OnceLock::new();

/// The process-wide fd table.
pub fn fd_table() -> &'static FdTable {
    TABLE.get_or_init(FdTable::new)
}
