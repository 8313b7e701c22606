//! Load simulator binary

use clap::Parser;
use ryw::Simulator;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ryw-sim")]
#[command(about = "Create rides and read them back against a running ryw-api")]
#[command(version)]
struct Cli {
    /// API port
    #[arg(long, env = "API_PORT")]
    port: u16,

    /// Credential sent in the Authorization header
    #[arg(long, default_value = "user@example.com")]
    email: String,

    /// Rounds to run (forever if omitted)
    #[arg(long)]
    iterations: Option<u64>,

    /// Wait for the API to come up
    #[arg(long, default_value = "3")]
    startup_delay_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tokio::time::sleep(Duration::from_secs(cli.startup_delay_secs)).await;

    let summary = Simulator::local(cli.port, cli.email).run(cli.iterations).await;
    tracing::info!(
        consistent = summary.consistent,
        stale = summary.stale,
        rejected = summary.rejected,
        read_failed = summary.read_failed,
        "Simulation finished"
    );
    if summary.stale > 0 {
        anyhow::bail!("{} read(s) missed their own write", summary.stale);
    }
    Ok(())
}
