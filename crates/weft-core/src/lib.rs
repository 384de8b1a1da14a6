//! # weft-core — leaf types for the weft fiber runtime
//!
//! No runtime machinery lives here: this crate holds the types and small
//! utilities the runtime and I/O layers share without depending on each
//! other.
//!
//! - [`id`] — fiber identifiers
//! - [`state`] — the fiber state machine
//! - [`error`] — error enums and the [`WeftResult`] alias
//! - [`env`] — typed environment-variable lookups
//! - [`wlog`] — leveled stderr logging macros
//! - [`hook_flag`] — the per-thread syscall-hook enable flag
//! - [`thread`] — OS thread identity

pub mod env;
pub mod error;
pub mod hook_flag;
pub mod id;
pub mod state;
pub mod thread;
pub mod wlog;

pub use env::{env_get, env_get_bool};
pub use error::{MemoryError, WeftError, WeftResult};
pub use id::FiberId;
pub use state::FiberState;
pub use thread::os_tid;
pub use wlog::LogLevel;
