//! StockPilot gateway binary.

mod api;
mod bootstrap;
mod runtime;
mod state;

use std::path::PathBuf;

use clap::Parser;

use sp_domain::config::Config;

#[derive(Parser, Debug)]
#[command(name = "stockpilot", about = "Conversational stock-analysis gateway")]
struct Cli {
    /// Path to config.toml (defaults apply when absent).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stockpilot=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = bootstrap::build_state(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "stockpilot gateway listening");

    axum::serve(listener, api::router::build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
