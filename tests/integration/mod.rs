//! Integration test suite for dinghy
//!
//! End-to-end tests driving whole webhooks through the push handler and the
//! HTTP router, with in-memory collaborators from `dinghy::test_utils`.
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! - **scenarios**: rendering and graph behavior over complete pushes
//! - **push_flow**: commit status transitions, responses, log events, notifiers
//! - **validate_mode**: pushes off the processing branch change nothing
//! - **http**: routes served by the axum router

#[path = "../common/mod.rs"]
mod common;

mod http;
mod push_flow;
mod scenarios;
mod validate_mode;
