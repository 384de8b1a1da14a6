//! Per-thread syscall-hook enable flag
//!
//! The flag lives here rather than in the I/O layer so the scheduler can
//! raise it inside worker loops without depending on the hook crate.
//! Defaults to false: threads outside the runtime see untouched syscalls.

use std::cell::Cell;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether hooked syscalls on this thread suspend the calling fiber.
#[inline]
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}

/// Enable or disable hooking for the current thread.
#[inline]
pub fn set_enabled(flag: bool) {
    HOOK_ENABLED.with(|cell| cell.set(flag));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_off_and_toggle() {
        assert!(!is_enabled());
        set_enabled(true);
        assert!(is_enabled());
        set_enabled(false);
        assert!(!is_enabled());
    }

    #[test]
    fn test_thread_local() {
        set_enabled(true);
        let other = std::thread::spawn(is_enabled).join().unwrap();
        assert!(!other);
        set_enabled(false);
    }
}
