//! Process counters exported at `/metrics`.
//!
//! All counters are monotonically increasing and updated with relaxed atomic
//! operations. [`Metrics::render`] produces the Prometheus text exposition
//! format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a webhook ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The rendered document was malformed or the pusher was denied.
    Failure,
    Error,
    /// Every changed file was ignored, or nothing needed rendering.
    Skipped,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Error => "error",
            Outcome::Skipped => "skipped",
        }
    }
}

/// Counters shared by every webhook handler.
#[derive(Debug, Default)]
pub struct Metrics {
    webhooks_received: AtomicU64,
    webhooks_rejected: AtomicU64,
    outcome_success: AtomicU64,
    outcome_failure: AtomicU64,
    outcome_error: AtomicU64,
    outcome_skipped: AtomicU64,
    dinghyfiles_rendered: AtomicU64,
    pipelines_upserted: AtomicU64,
    pipelines_deleted: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn webhook_received(&self) {
        self.webhooks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A webhook failed signature validation or could not be decoded.
    pub fn webhook_rejected(&self) {
        self.webhooks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn webhook_finished(&self, outcome: Outcome) {
        self.outcome_counter(outcome).fetch_add(1, Ordering::Relaxed);
    }

    pub fn dinghyfile_rendered(&self) {
        self.dinghyfiles_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pipeline_upserted(&self) {
        self.pipelines_upserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pipeline_deleted(&self) {
        self.pipelines_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn webhooks_received(&self) -> u64 {
        self.webhooks_received.load(Ordering::Relaxed)
    }

    pub fn outcome(&self, outcome: Outcome) -> u64 {
        self.outcome_counter(outcome).load(Ordering::Relaxed)
    }

    pub fn pipelines_upserted(&self) -> u64 {
        self.pipelines_upserted.load(Ordering::Relaxed)
    }

    pub fn pipelines_deleted(&self) -> u64 {
        self.pipelines_deleted.load(Ordering::Relaxed)
    }

    fn outcome_counter(&self, outcome: Outcome) -> &AtomicU64 {
        match outcome {
            Outcome::Success => &self.outcome_success,
            Outcome::Failure => &self.outcome_failure,
            Outcome::Error => &self.outcome_error,
            Outcome::Skipped => &self.outcome_skipped,
        }
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> String {
        let mut out = String::new();
        counter(
            &mut out,
            "dinghy_webhooks_received_total",
            "Webhooks received",
            &[("", &self.webhooks_received)],
        );
        counter(
            &mut out,
            "dinghy_webhooks_rejected_total",
            "Webhooks rejected before processing",
            &[("", &self.webhooks_rejected)],
        );
        let outcomes: Vec<(String, &AtomicU64)> =
            [Outcome::Success, Outcome::Failure, Outcome::Error, Outcome::Skipped]
                .into_iter()
                .map(|o| (format!("outcome=\"{}\"", o.label()), self.outcome_counter(o)))
                .collect();
        let outcomes: Vec<(&str, &AtomicU64)> =
            outcomes.iter().map(|(l, c)| (l.as_str(), *c)).collect();
        counter(
            &mut out,
            "dinghy_webhooks_processed_total",
            "Webhooks processed by outcome",
            &outcomes,
        );
        counter(
            &mut out,
            "dinghy_dinghyfiles_rendered_total",
            "Dinghyfiles rendered",
            &[("", &self.dinghyfiles_rendered)],
        );
        counter(
            &mut out,
            "dinghy_pipelines_upserted_total",
            "Pipelines created or updated",
            &[("", &self.pipelines_upserted)],
        );
        counter(
            &mut out,
            "dinghy_pipelines_deleted_total",
            "Stale pipelines deleted",
            &[("", &self.pipelines_deleted)],
        );
        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, series: &[(&str, &AtomicU64)]) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    for (labels, value) in series {
        let value = value.load(Ordering::Relaxed);
        if labels.is_empty() {
            let _ = writeln!(out, "{name} {value}");
        } else {
            let _ = writeln!(out, "{name}{{{labels}}} {value}");
        }
    }
}
