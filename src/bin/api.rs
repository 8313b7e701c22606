//! API binary

use clap::Parser;
use ryw::common::Config;
use ryw::ApiServer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ryw-api")]
#[command(about = "HTTP API with read-your-writes replica routing")]
#[command(version)]
struct Cli {
    /// Port to listen on (overrides API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Config file (overrides RYW_CONFIG)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(port) = cli.port {
        config.port = Some(port);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    ApiServer::new(config).serve().await?;
    Ok(())
}
