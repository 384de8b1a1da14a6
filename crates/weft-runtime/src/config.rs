//! Runtime configuration
//!
//! Compile-time defaults with environment overrides and builder-style
//! customization. The process-wide config is read by fiber construction
//! and the syscall hook layer; install overrides with [`set_config`]
//! before the runtime starts.
//!
//! Environment variables (all optional):
//! - `WEFT_STACK_SIZE` — default per-fiber stack size in bytes
//! - `WEFT_WORKERS` — default worker count when 0 is requested
//! - `WEFT_CONNECT_TIMEOUT_MS` — connect timeout when no per-fd send
//!   timeout is set
//! - `WEFT_ACCEPT_READ_TIMEOUT_MS` — recv timeout stamped on accepted fds

use parking_lot::RwLock;
use std::sync::OnceLock;

use weft_core::env::env_get;
use weft_core::error::{WeftError, WeftResult};

use crate::stack::MIN_STACK_SIZE;

/// Defaults baked into the binary.
pub mod defaults {
    /// Per-fiber stack size in bytes.
    pub const STACK_SIZE: usize = 128 * 1024;
    /// Connect timeout in milliseconds.
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;
    /// Recv timeout applied to accepted connections, in milliseconds.
    pub const ACCEPT_READ_TIMEOUT_MS: i64 = 120_000;
}

/// Process-wide runtime knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default per-fiber stack size in bytes
    pub stack_size: usize,
    /// Worker count used when a scheduler is built with 0 workers
    pub default_workers: usize,
    /// Connect timeout when the fd carries no send timeout
    pub connect_timeout_ms: u64,
    /// Recv timeout stamped on fds returned by the accept hook;
    /// -1 leaves them without a timeout
    pub accept_read_timeout_ms: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("WEFT_STACK_SIZE", defaults::STACK_SIZE),
            default_workers: env_get("WEFT_WORKERS", num_cpus::get()),
            connect_timeout_ms: env_get("WEFT_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
            accept_read_timeout_ms: env_get(
                "WEFT_ACCEPT_READ_TIMEOUT_MS",
                defaults::ACCEPT_READ_TIMEOUT_MS,
            ),
        }
    }

    /// Compile-time defaults, no environment consulted.
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            default_workers: num_cpus::get(),
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            accept_read_timeout_ms: defaults::ACCEPT_READ_TIMEOUT_MS,
        }
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn default_workers(mut self, n: usize) -> Self {
        self.default_workers = n;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn accept_read_timeout_ms(mut self, ms: i64) -> Self {
        self.accept_read_timeout_ms = ms;
        self
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> WeftResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(WeftError::Config("stack_size below minimum"));
        }
        if self.default_workers == 0 {
            return Err(WeftError::Config("default_workers must be > 0"));
        }
        if self.accept_read_timeout_ms < -1 {
            return Err(WeftError::Config("accept_read_timeout_ms must be >= -1"));
        }
        Ok(())
    }
}

static CONFIG: OnceLock<RwLock<RuntimeConfig>> = OnceLock::new();

fn cell() -> &'static RwLock<RuntimeConfig> {
    CONFIG.get_or_init(|| RwLock::new(RuntimeConfig::from_env()))
}

/// Snapshot of the process-wide config.
pub fn config() -> RuntimeConfig {
    cell().read().clone()
}

/// Replace the process-wide config. Fibers and sockets created before
/// the call keep the values they were built with.
pub fn set_config(cfg: RuntimeConfig) -> WeftResult<()> {
    cfg.validate()?;
    *cell().write() = cfg;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::new();
        assert_eq!(cfg.stack_size, 128 * 1024);
        assert_eq!(cfg.connect_timeout_ms, 5000);
        assert_eq!(cfg.accept_read_timeout_ms, 120_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let cfg = RuntimeConfig::new()
            .stack_size(256 * 1024)
            .connect_timeout_ms(750);
        assert_eq!(cfg.stack_size, 256 * 1024);
        assert_eq!(cfg.connect_timeout_ms, 750);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new().default_workers(0).validate().is_err());
        assert!(set_config(RuntimeConfig::new().stack_size(0)).is_err());
    }

    #[test]
    fn test_global_snapshot() {
        let cfg = config();
        assert!(cfg.stack_size >= MIN_STACK_SIZE);
    }
}
