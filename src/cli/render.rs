//! `dinghy render`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde_json::{Map, Value};

use crate::config::Settings;
use crate::push::PushHandler;
use crate::renderer::VarStack;
use crate::server::Providers;
use crate::vcs::{Downloader, FileLocation};

#[derive(Args, Debug)]
pub struct RenderCommand {
    /// Local dinghyfile to render.
    pub(super) file: PathBuf,

    /// Variables as a JSON object, visible to `var` like module parameters.
    #[arg(long)]
    pub(super) vars: Option<String>,

    /// Organization the file pretends to live in. Defaults to `template_org`.
    #[arg(long)]
    org: Option<String>,

    /// Repository the file pretends to live in. Defaults to `template_repo`.
    #[arg(long)]
    repo: Option<String>,

    /// Branch used to resolve modules.
    #[arg(long, default_value = "master")]
    branch: String,
}

impl RenderCommand {
    pub async fn execute(self, settings: Arc<Settings>) -> Result<()> {
        let providers = Providers::from_settings(&settings)?;
        let handler = super::build_handler(settings).await?;
        let rendered = self.render(&handler, providers.modules()).await?;
        println!("{rendered}");
        Ok(())
    }

    /// Render the file through `handler` and return the output.
    pub async fn render(
        &self,
        handler: &PushHandler,
        modules: Arc<dyn Downloader>,
    ) -> Result<String> {
        let body = tokio::fs::read_to_string(&self.file)
            .await
            .with_context(|| format!("Failed to read {}", self.file.display()))?;
        let vars = match &self.vars {
            Some(vars) => VarStack::with_frame(parse_vars(vars)?),
            None => VarStack::new(),
        };

        let settings = handler.settings();
        let location = FileLocation {
            org: self.org.clone().unwrap_or_else(|| settings.template_org.clone()),
            repo: self.repo.clone().unwrap_or_else(|| settings.template_repo.clone()),
            path: settings.dinghy_filename.clone(),
            branch: self.branch.clone(),
        };
        let done = handler
            .render_uncommitted(modules, &location, body, vars)
            .await
            .with_context(|| format!("Failed to render {}", self.file.display()))?;
        tracing::info!(
            "{} renders {} pipeline(s) for {}",
            self.file.display(),
            done.pipelines.len(),
            done.application
        );
        Ok(done.rendered)
    }
}

fn parse_vars(text: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(text).context("--vars is not valid JSON")? {
        Value::Object(vars) => Ok(vars),
        other => bail!("--vars must be a JSON object, got {other}"),
    }
}
