//! Fiber identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide id source. Id 0 is reserved for per-thread main fibers,
/// matching the convention that the main fiber was never explicitly
/// created by anyone.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a fiber.
///
/// Ids are issued monotonically for the lifetime of the process and are
/// never reused. The value 0 identifies a thread's main fiber.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Id carried by every thread main fiber.
    pub const MAIN: FiberId = FiberId(0);

    /// Issue a fresh id.
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check whether this id names a main fiber.
    #[inline]
    pub const fn is_main(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = FiberId::next();
        let b = FiberId::next();
        let c = FiberId::next();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_main_sentinel() {
        assert!(FiberId::MAIN.is_main());
        assert!(!FiberId::next().is_main());
        assert_eq!(FiberId::MAIN.as_u64(), 0);
    }
}
