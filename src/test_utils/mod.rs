//! Test utilities for dinghy
//!
//! In-memory stand-ins for every external collaborator, so renders, builds
//! and whole webhooks can be exercised without a VCS or an orchestrator:
//!
//! - [`MemoryDownloader`] - files keyed by `(org, repo, path, branch)`
//! - [`FakeOrchestrator`] - applications, pipelines and roles in memory, with
//!   every write recorded
//! - [`FakePush`] - a push event that records the statuses posted to it
//! - [`RecordingNotifier`] and [`RecordingEventSink`] - capture what was sent
//!
//! # Example
//!
//! ```rust,no_run
//! use dinghy::test_utils::{FakeOrchestrator, MemoryDownloader};
//!
//! let downloader = MemoryDownloader::new();
//! downloader.insert("armory", "templates", "wait", "master", r#"{"type": "wait"}"#);
//!
//! let orchestrator = FakeOrchestrator::new();
//! orchestrator.add_pipeline("app", "deploy", "id-1");
//! ```

mod downloader;
pub mod fixtures;
mod orchestrator;
mod recorders;

pub use downloader::MemoryDownloader;
pub use orchestrator::FakeOrchestrator;
pub use recorders::{FakePush, RecordingEventSink, RecordingNotifier};

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Only the first call has any effect. With `None` the `RUST_LOG` environment
/// variable decides; when it is unset nothing is logged.
///
/// ```bash
/// RUST_LOG=dinghy=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .try_init();
    });
}
