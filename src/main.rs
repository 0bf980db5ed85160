use std::sync::Arc;

use anyhow::Context;
use config::Config;
use ledger::FileLedger;
use server::{Outcome, Server};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod barrier;
mod client;
mod config;
mod draw;
mod ledger;
mod protocol;
mod registry;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // connect tracing to stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lottery_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load the configuration")?;
    tracing::info!(?config, "configuration loaded");

    let ledger = FileLedger::open(&config.ledger_path)
        .with_context(|| format!("failed to open the ledger at {}", config.ledger_path.display()))?;

    let server = Server::bind(config, Arc::new(ledger)).context("failed to bind the server")?;
    tracing::info!("server is listening on: {}", server.local_addr()?);

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match termination().await {
            Ok(()) => {
                shutdown.trigger();
            }
            Err(err) => tracing::error!("failed to listen for termination signals: {}", err),
        }
    });

    match server.run().await? {
        Outcome::Drawn(summary) => tracing::info!(
            winners = summary.winners,
            dropped = ?summary.dropped,
            "finished the draw"
        ),
        Outcome::ShutDown => tracing::info!("stopped before the draw"),
    }

    Ok(())
}

// resolves on the first SIGINT or SIGTERM
async fn termination() -> tokio::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            interrupted = signal::ctrl_c() => interrupted?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    Ok(())
}
