//! Architecture-specific CPU context save/restore
//!
//! Each backend exposes the same three items:
//!
//! - `Context` — the callee-saved register set, `#[repr(C)]` because the
//!   switch assembly addresses fields by offset
//! - `init_context` — stage a fresh context so the first switch lands in
//!   the entry trampoline with the entry function and argument loaded
//! - `switch_context` — save the callee-saved set into one context and
//!   restore from another
//!
//! Only the voluntary switch exists: fibers give up the CPU themselves,
//! there is no forced preemption path.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{init_context, switch_context, Context};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{init_context, switch_context, Context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("weft-runtime supports x86_64 and aarch64 only");
