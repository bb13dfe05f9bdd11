use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chatwire::{Config, Server, TracingSink};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    let deadline = config.shutdown_deadline;

    let server = Server::bind(config).await?.with_events(Arc::new(TracingSink));
    let running = server.start();

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("interrupt received, shutting down");
        }
        _ = running.stopped() => {
            warn!("server stopped accepting, shutting down");
        }
    }

    let report = running.shutdown(deadline).await?;
    info!(closed = report.closed, "bye");

    Ok(())
}
