//! Command-line interface for dinghy.
//!
//! - `serve` - run the webhook server
//! - `render` - render a local dinghyfile and print the result
//!
//! Both commands load [`Settings`] from `--config` (TOML or YAML), apply the
//! `DINGHY_*` environment overlay, and build the same collaborators. `render`
//! wraps the graph and orchestrator in read-only surrogates, so it never
//! changes anything.
//!
//! ```bash
//! dinghy serve --config dinghy.toml --port 8081
//! dinghy render apps/web/dinghyfile --vars '{"env": "staging"}'
//! ```

mod render;
mod serve;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::graph::{DependencyManager, MemoryDependencyGraph, SnapshotDependencyGraph};
use crate::logevents::LogEventStore;
use crate::metrics::Metrics;
use crate::notifier::Notifiers;
use crate::orchestrator::HttpOrchestrator;
use crate::push::PushHandler;

pub use render::RenderCommand;
pub use serve::ServeCommand;

/// Webhook-driven pipeline-as-code compiler.
#[derive(Parser, Debug)]
#[command(
    name = "dinghy",
    version,
    about = "Render dinghyfile templates into orchestrator pipelines"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML, or YAML for `.yaml`/`.yml`).
    #[arg(short, long, global = true, env = "DINGHY_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook server.
    Serve(ServeCommand),
    /// Render a local dinghyfile without changing anything.
    Render(RenderCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        init_logging(self.verbose);
        let settings = Arc::new(Settings::load(self.config.as_deref()).await?);
        match self.command {
            Commands::Serve(cmd) => cmd.execute(settings).await,
            Commands::Render(cmd) => cmd.execute(settings).await,
        }
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &'static str {
        if self.verbose { "debug" } else { "info" }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

/// Graph backend chosen by `graph_snapshot_path`.
async fn build_graph(settings: &Settings) -> Result<Arc<dyn DependencyManager>> {
    Ok(match &settings.graph_snapshot_path {
        Some(path) => {
            tracing::info!("using dependency graph snapshot at {}", path);
            Arc::new(SnapshotDependencyGraph::open(path).await?)
        }
        None => Arc::new(MemoryDependencyGraph::new()),
    })
}

/// The push handler with production collaborators.
async fn build_handler(settings: Arc<Settings>) -> Result<PushHandler> {
    let graph = build_graph(&settings).await?;
    let orchestrator = Arc::new(HttpOrchestrator::new(&settings.orchestrator)?);
    let notifiers = Notifiers::from_settings(&settings)?;
    let log_events = Arc::new(LogEventStore::with_ttl_minutes(settings.log_event_ttl_minutes));
    Ok(PushHandler::new(
        settings,
        graph,
        orchestrator,
        notifiers,
        log_events,
        Arc::new(Metrics::new()),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from([
            "dinghy",
            "serve",
            "--port",
            "9000",
            "-v",
            "--config",
            "dinghy.toml",
        ]);
        assert_eq!(cli.log_level(), "debug");
        assert_eq!(cli.config_path(), Some(Path::new("dinghy.toml")));
        let Commands::Serve(cmd) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(cmd.port, Some(9000));
    }

    #[test]
    fn test_parse_render() {
        let cli =
            Cli::parse_from(["dinghy", "render", "dinghyfile", "--vars", r#"{"env": "prod"}"#]);
        assert_eq!(cli.log_level(), "info");
        let Commands::Render(cmd) = cli.command else {
            panic!("expected render");
        };
        assert_eq!(cmd.file, PathBuf::from("dinghyfile"));
        assert_eq!(cmd.vars.as_deref(), Some(r#"{"env": "prod"}"#));
    }

    #[tokio::test]
    async fn test_snapshot_graph_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let settings = Settings {
            graph_snapshot_path: Some(path.to_string_lossy().into_owned()),
            ..Settings::default()
        };
        let graph = build_graph(&settings).await.unwrap();
        graph.set_deps("parent", &["child".to_string()]).await.unwrap();
        assert!(path.exists());
    }
}
