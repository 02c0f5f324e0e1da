//! Multi-topic consumer that hands records to immediate or batch handlers.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` for the full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for anyhow errors, they only show the top-level message.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source. Avoid `anyhow!("...{e}")`, which formats the error into a string and drops the chain.

pub mod accumulator;
pub mod config;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod policy;
pub mod progress;
pub mod relay;
pub mod retry;
pub mod server;
pub mod test_utils;

pub use handler::{BatchHandler, HandlerBinding, HandlerRegistry, ImmediateHandler};
pub use policy::BatchPolicy;
pub use progress::ProgressTracker;
