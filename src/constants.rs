//! Global constants used throughout the dinghy codebase.
//!
//! This module contains timeout durations, retry parameters, and other
//! numeric constants that are used across multiple modules. Defining
//! them centrally keeps the orchestrator, VCS, and push handling code
//! in agreement about limits.

use std::time::Duration;

/// Context key attached to every commit status posted by dinghy.
///
/// Listing statuses for a commit filters on this key so statuses from other
/// CI systems are ignored.
pub const STATUS_CONTEXT: &str = "dinghy";

/// Maximum length of a commit status description.
///
/// VCS providers reject longer descriptions; longer text is truncated with an
/// ellipsis.
pub const MAX_STATUS_DESCRIPTION_LEN: usize = 140;

/// Default base name of a root template document.
pub const DEFAULT_DINGHY_FILENAME: &str = "dinghyfile";

/// Placeholder email applied to applications whose spec omits one.
pub const DEFAULT_APPLICATION_EMAIL: &str = "unknown@unknown.com";

/// Secret lookup key used when no repository-specific webhook secret exists.
pub const DEFAULT_WEBHOOK_SECRET_REPO: &str = "default-webhook-secret";

/// Branches treated as the default branch when no repo-specific config exists.
pub const DEFAULT_BRANCHES: &[&str] = &["master", "main"];

/// Branch of the template repo that modules are read from when rendering a
/// file that lives in another repo.
pub const TEMPLATE_MODULE_BRANCH: &str = "master";

/// Maximum nesting depth for module expansion.
///
/// Modules that include each other would otherwise recurse until the stack is
/// exhausted.
pub const MAX_MODULE_DEPTH: usize = 32;

/// Maximum backoff delay for exponential backoff (5 seconds).
pub const MAX_BACKOFF_DELAY_MS: u64 = 5_000;

/// Starting delay for exponential backoff (100ms).
///
/// This is the initial delay used in exponential backoff calculations,
/// which doubles on each retry attempt.
pub const STARTING_BACKOFF_DELAY_MS: u64 = 100;

/// Number of retries for orchestrator and VCS HTTP calls.
pub const DEFAULT_HTTP_RETRIES: usize = 5;

/// Interval between orchestrator task status polls (2 seconds).
pub const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Total time to wait for an orchestrator task to finish (5 minutes).
pub const TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for a single outbound HTTP request (30 seconds).
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the webhook response may wait on notifier fan-out (5 seconds).
pub const NOTIFIER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time-to-live for stored log events, in minutes.
pub const DEFAULT_LOG_EVENT_TTL_MINUTES: u64 = 15;

/// Default HTTP port for the webhook server.
pub const DEFAULT_PORT: u16 = 8081;
