//! `dinghy serve`

use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use crate::config::Settings;
use crate::server::{AppState, Providers, serve};

#[derive(Args, Debug)]
pub struct ServeCommand {
    /// Port to listen on, overriding `server.port`.
    #[arg(short, long)]
    pub(super) port: Option<u16>,
}

impl ServeCommand {
    pub async fn execute(self, settings: Arc<Settings>) -> Result<()> {
        let port = self.port.unwrap_or(settings.server.port);
        let providers = Arc::new(Providers::from_settings(&settings)?);
        let handler = Arc::new(super::build_handler(settings).await?);
        serve(AppState::new(handler, providers), port).await
    }
}
