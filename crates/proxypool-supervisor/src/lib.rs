//! Process supervision primitives for proxypool.
//!
//! The pool engine never talks to `tokio::process` directly: both the live
//! tunnel and the short-lived probe instances are spawned through
//! [`ManagedProcess`], which guarantees a graceful-then-forced shutdown path.

pub mod binary;
pub mod process;

pub use binary::{ensure_executable, resolve_binary};
pub use process::{ManagedProcess, OutputMode};
