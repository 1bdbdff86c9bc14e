//! Shared helpers for outbound HTTP and on-disk state.
//!
//! - [`retry`] - HTTP requests with exponential backoff
//! - [`atomic`] - crash-safe file writes

pub mod atomic;
pub mod retry;

pub use atomic::atomic_write;
pub use retry::{HttpStatusError, send_with_retry};
