//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults,
//! used by the config layer.
//!
//! ```ignore
//! use weft_core::env::{env_get, env_get_bool};
//!
//! let stack: usize = env_get("WEFT_STACK_SIZE", 128 * 1024);
//! let flush: bool = env_get_bool("WEFT_FLUSH_LOG", false);
//! ```

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default.
///
/// Unset and unparsable values both fall back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean.
///
/// "1", "true", "yes", "on" (case-insensitive) are true; any other set
/// value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
