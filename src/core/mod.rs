//! Core types shared by every dinghy subsystem.
//!
//! - [`error`] - the classified [`DinghyError`] taxonomy and its HTTP / commit
//!   status mapping
//! - [`log`] - [`DinghyLog`], the per-webhook capture log that feeds log events

pub mod error;
pub mod log;

pub use error::{DinghyError, DownloadErrorKind, RenderStage, classify};
pub use log::DinghyLog;
