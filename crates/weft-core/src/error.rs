//! Error types shared across the runtime

use core::fmt;

/// Result type for runtime operations
pub type WeftResult<T> = Result<T, WeftError>;

/// Errors surfaced by the fiber runtime and the reactor.
///
/// Syscall wrappers never return these: the hook layer always translates
/// failures into errno-style returns at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// Operation attempted in a fiber state that does not permit it
    InvalidState,

    /// Scheduler started twice, or an operation needs a started scheduler
    AlreadyStarted,

    /// No scheduler/reactor is installed on the current thread
    NoScheduler,

    /// (fd, event) already has a parked continuation
    EventExists,

    /// (fd, event) has no registered continuation
    NoSuchEvent,

    /// Rejected configuration value
    Config(&'static str),

    /// Stack or mapping failure
    Memory(MemoryError),

    /// Raw OS call failed; `errno` captured at the call site
    Os { call: &'static str, errno: i32 },
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeftError::InvalidState => write!(f, "invalid fiber state for operation"),
            WeftError::AlreadyStarted => write!(f, "scheduler already started"),
            WeftError::NoScheduler => write!(f, "no scheduler on this thread"),
            WeftError::EventExists => write!(f, "event already registered for fd"),
            WeftError::NoSuchEvent => write!(f, "no such event registered for fd"),
            WeftError::Config(msg) => write!(f, "invalid config: {}", msg),
            WeftError::Memory(e) => write!(f, "memory error: {}", e),
            WeftError::Os { call, errno } => write!(f, "{} failed: errno {}", call, errno),
        }
    }
}

impl std::error::Error for WeftError {}

/// Stack-mapping errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect of the guard page failed
    ProtectionFailed,

    /// Requested stack size below the supported minimum
    StackTooSmall,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "guard page protection failed"),
            MemoryError::StackTooSmall => write!(f, "stack size below minimum"),
        }
    }
}

impl From<MemoryError> for WeftError {
    fn from(e: MemoryError) -> Self {
        WeftError::Memory(e)
    }
}

/// Capture the current `errno` into a [`WeftError::Os`].
pub fn os_error(call: &'static str) -> WeftError {
    WeftError::Os {
        call,
        errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", WeftError::Memory(MemoryError::AllocationFailed)),
            "memory error: stack allocation failed"
        );
        assert_eq!(
            format!("{}", WeftError::Os { call: "epoll_ctl", errno: 9 }),
            "epoll_ctl failed: errno 9"
        );
    }

    #[test]
    fn test_memory_conversion() {
        let e: WeftError = MemoryError::ProtectionFailed.into();
        assert_eq!(e, WeftError::Memory(MemoryError::ProtectionFailed));
    }
}
