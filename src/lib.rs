//! dinghy - pipeline-as-code compiler
//!
//! dinghy listens for push webhooks from a version-control system. When a
//! push changes a root template document (a *dinghyfile*), it renders the
//! document, expanding shared modules fetched from a template repository, and
//! turns the result into applications and pipelines on a deployment
//! orchestrator. When a push changes a shared module, every dinghyfile that
//! transitively uses the module is rebuilt.
//!
//! # Architecture Overview
//!
//! ```text
//! webhook ──► server ──► push::PushHandler ──► builder::PipelineBuilder ──► orchestrator
//!                           │                     │
//!                           │                     └──► renderer ──► template engine
//!                           │                            │
//!                           └── commit status,           ├──► vcs::Downloader (modules)
//!                               log event, notifiers     └──► graph (module deps)
//! ```
//!
//! # Core Modules
//!
//! ## Rendering
//! - [`preprocessor`] - normalizes template actions before parsing
//! - [`template`] - Go-style text template engine with async function calls
//! - [`renderer`] - dinghyfile rendering: modules, variables, globals
//! - [`graph`] - module dependency graph used for rebuilds
//!
//! ## Applying
//! - [`builder`] - dinghyfile model, application and pipeline reconciliation
//! - [`orchestrator`] - orchestrator client and its read-only surrogate
//!
//! ## Webhooks
//! - [`push`] - the per-webhook state machine, signatures, ignore patterns
//! - [`vcs`] - push events, downloads and commit statuses per provider
//! - [`server`] - HTTP routes
//! - [`notifier`] - success and failure notifications
//! - [`logevents`] - per-webhook log records
//! - [`metrics`] - process counters
//!
//! ## Supporting Modules
//! - [`cli`] - `dinghy serve` and `dinghy render`
//! - [`config`] - [`Settings`](config::Settings) loading
//! - [`core`] - error taxonomy and the capture log
//! - [`constants`] - timeouts, retry budgets, default names
//! - [`utils`] - retrying HTTP and atomic writes
//!
//! # Processing vs validating
//!
//! A push to the processing branch (per `repo_config`, else `master` or
//! `main`) is *processed*: pipelines are written and the dependency graph is
//! updated. Any other push is *validated*: the same render and build run
//! against read-only surrogates and only the commit status reflects the result.

pub mod builder;
pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod graph;
pub mod logevents;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;
pub mod preprocessor;
pub mod push;
pub mod renderer;
pub mod server;
pub mod template;
pub mod utils;
pub mod vcs;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
