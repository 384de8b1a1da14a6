//! errno access for the hook layer
//!
//! Hooked functions keep kernel errno semantics: failures set errno and
//! return -1, exactly like the calls they stand in for.

/// Read the calling thread's errno.
#[inline]
pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Set the calling thread's errno.
#[inline]
pub fn set_errno(value: i32) {
    unsafe {
        *libc::__errno_location() = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_read() {
        set_errno(libc::ETIMEDOUT);
        assert_eq!(errno(), libc::ETIMEDOUT);
        set_errno(0);
        assert_eq!(errno(), 0);
    }

    #[test]
    fn test_failed_syscall_sets_errno() {
        set_errno(0);
        let rt = unsafe { libc::close(-1) };
        assert_eq!(rt, -1);
        assert_eq!(errno(), libc::EBADF);
        set_errno(0);
    }
}
