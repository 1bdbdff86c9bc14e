//! dinghy entry point.
//!
//! - `serve` - run the webhook server
//! - `render` - render a local dinghyfile

use anyhow::Result;
use clap::Parser;
use dinghy::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = cli.execute().await {
        tracing::error!("{:#}", e);
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
