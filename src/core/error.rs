//! Error handling for dinghy
//!
//! This module defines the classified failures that can occur while turning a
//! push into orchestrator pipelines. Errors are raised by the deepest layer that
//! knows what went wrong (the downloader knows a file is missing, the builder
//! knows a document is malformed) and are forwarded unchanged by every layer
//! above it. The push handler is the single place that turns a [`DinghyError`]
//! into an HTTP status, a commit status and a log-event record.
//!
//! # Error Categories
//!
//! - **Documents**: [`DinghyError::MalformedDocument`]
//! - **Downloads**: [`DinghyError::Download`] with a [`DownloadErrorKind`]
//! - **Rendering**: [`DinghyError::Render`] with a [`RenderStage`]
//! - **Orchestrator**: [`DinghyError::Orchestrator`], [`DinghyError::Timeout`]
//! - **Access**: [`DinghyError::UserNotFound`], [`DinghyError::UserNotAuthorized`]
//! - **Webhooks**: [`DinghyError::SignatureInvalid`]
//!
//! Boundary code (configuration loading, CLI, HTTP adapters) works with
//! [`anyhow::Error`] and recovers the classification with [`classify`].

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::vcs::CommitState;

/// Why a download failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadErrorKind {
    /// The file does not exist at the requested ref.
    FileNotFound,
    /// Network or provider failure.
    Transport,
    /// The provider refused the request because of rate limiting.
    RateLimited,
}

impl fmt::Display for DownloadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileNotFound => write!(f, "file not found"),
            Self::Transport => write!(f, "transport error"),
            Self::RateLimited => write!(f, "rate limited"),
        }
    }
}

/// The render step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    /// Text normalization before the template is parsed.
    Preprocess,
    /// Template parsing or execution.
    Template,
    /// Extraction of the top-level `globals` block.
    GlobalVars,
    /// Module expansion exceeded the nesting limit.
    ModuleRecursion,
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preprocess => write!(f, "preprocess"),
            Self::Template => write!(f, "template"),
            Self::GlobalVars => write!(f, "global vars"),
            Self::ModuleRecursion => write!(f, "module recursion"),
        }
    }
}

/// The main error type for dinghy operations.
///
/// Each variant carries enough context (paths, URLs, application names) to
/// be useful in a commit status description or a notifier message without
/// the caller having to add anything.
#[derive(Error, Debug)]
pub enum DinghyError {
    /// The rendered dinghyfile could not be unmarshalled.
    ///
    /// Reported as HTTP 422 and a `failure` commit status: the author has to
    /// fix the document, retrying will not help.
    #[error("malformed {format} in {path}: {message}")]
    MalformedDocument {
        /// Path of the dinghyfile inside its repository
        path: String,
        /// Parser format that rejected the document
        format: String,
        /// Parser diagnostic
        message: String,
    },

    /// A file could not be fetched from the VCS.
    #[error("failed to download {url}: {kind}: {message}")]
    Download {
        /// Classification of the failure
        kind: DownloadErrorKind,
        /// Encoded file URL
        url: String,
        /// Provider or transport diagnostic
        message: String,
    },

    /// A template could not be rendered.
    #[error("failed to render {path} ({stage}): {message}")]
    Render {
        /// Step that failed
        stage: RenderStage,
        /// Path of the template being rendered
        path: String,
        /// Diagnostic, including line and column when known
        message: String,
    },

    /// An orchestrator call failed after retries.
    #[error("orchestrator {operation} failed: {message}")]
    Orchestrator {
        /// Operation description, e.g. "upsert pipeline deploy"
        operation: String,
        /// Response body or transport diagnostic
        message: String,
    },

    /// The pusher is unknown to the orchestrator's authorization service.
    #[error("user {user} not found")]
    UserNotFound {
        /// Login of the pusher
        user: String,
    },

    /// The pusher has no role in the application's WRITE permission set.
    #[error("user {user} is not authorized to modify application {application}")]
    UserNotAuthorized {
        /// Login of the pusher
        user: String,
        /// Application the dinghyfile targets
        application: String,
    },

    /// The webhook HMAC did not match the configured secret.
    #[error("invalid webhook signature for {provider} {org}/{repo}")]
    SignatureInvalid {
        /// Provider tag
        provider: String,
        /// Organization of the pushed repository
        org: String,
        /// Pushed repository
        repo: String,
    },

    /// Polling an orchestrator task exceeded its budget.
    #[error("timed out after {}s waiting for {operation}", waited.as_secs())]
    Timeout {
        /// What was being waited on
        operation: String,
        /// Total time spent waiting
        waited: Duration,
    },

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// One or more dinghyfiles failed during a module rebuild.
    ///
    /// Individual failures do not stop the rebuild; they are collected here.
    #[error(
        "failed to rebuild {} of {total} dinghyfile(s): {}",
        failures.len(),
        summarize(failures)
    )]
    Rebuild {
        /// Number of roots that were processed
        total: usize,
        /// Root URL and failure for every root that failed
        failures: Vec<(String, DinghyError)>,
    },
}

fn summarize(failures: &[(String, DinghyError)]) -> String {
    failures
        .iter()
        .map(|(url, err)| format!("{url}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DinghyError {
    /// Build a download error.
    pub fn download(
        kind: DownloadErrorKind,
        url: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Download {
            kind,
            url: url.into(),
            message: message.into(),
        }
    }

    /// Build a render error.
    pub fn render(stage: RenderStage, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Render {
            stage,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build an orchestrator error.
    pub fn orchestrator(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Orchestrator {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True for malformed-document failures, including inside a rebuild.
    pub fn is_malformed(&self) -> bool {
        match self {
            Self::MalformedDocument {
                ..
            } => true,
            Self::Rebuild {
                failures,
                ..
            } => failures.iter().any(|(_, e)| e.is_malformed()),
            _ => false,
        }
    }

    /// True when a file was missing, including inside a rebuild.
    pub fn is_file_not_found(&self) -> bool {
        match self {
            Self::Download {
                kind: DownloadErrorKind::FileNotFound,
                ..
            } => true,
            Self::Rebuild {
                failures,
                ..
            } => failures.iter().any(|(_, e)| e.is_file_not_found()),
            _ => false,
        }
    }

    /// HTTP status reported for this error when it ends a webhook.
    ///
    /// Missing files only map to 404 when the caller is rebuilding modules;
    /// everywhere else a missing file is an internal failure. A rebuild that
    /// hit a malformed dinghyfile is still a 500, matching its `Error` state.
    pub fn http_status(&self, rebuilding: bool) -> u16 {
        let aggregate = matches!(self, Self::Rebuild { .. });
        if self.is_malformed() && !aggregate {
            422
        } else if rebuilding && self.is_file_not_found() {
            404
        } else {
            500
        }
    }

    /// Commit status state reported for this error.
    pub fn commit_state(&self) -> CommitState {
        match self {
            Self::MalformedDocument {
                ..
            }
            | Self::UserNotFound {
                ..
            }
            | Self::UserNotAuthorized {
                ..
            } => CommitState::Failure,
            _ => CommitState::Error,
        }
    }
}

/// Recover a [`DinghyError`] from an [`anyhow::Error`].
///
/// Errors that were never classified become [`DinghyError::Orchestrator`]
/// with operation `"unclassified"` so the push handler can still report them.
pub fn classify(err: anyhow::Error) -> DinghyError {
    match err.downcast::<DinghyError>() {
        Ok(classified) => classified,
        Err(other) => DinghyError::orchestrator("unclassified", format!("{other:#}")),
    }
}

/// Result alias for operations that fail with a classified error.
pub type Result<T, E = DinghyError> = std::result::Result<T, E>;
