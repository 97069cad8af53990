//! Results publisher binary.
//!
//! Configured from the environment (see [`PublisherConfig::from_env`]).
//! Management requests are read from stdin as JSON, one per line, and each
//! response is written to stdout as a single line.

use anyhow::{Context, Result};
use live_results_publisher::management::{self, ACTIONS};
use live_results_publisher::{Distributor, PublisherConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only management responses.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting live results publisher"
    );

    let config = PublisherConfig::from_env()?;
    let (distributor, task) = Distributor::spawn(config.distributor());

    let (status_tx, mut status_rx) = mpsc::channel(16);
    distributor
        .register_status_listener(status_tx)
        .await
        .context("Failed to register status listener")?;
    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            tracing::info!(
                watched_file = %status.watched_file,
                active_watch = status.active_watch,
                targets = ?status.targets,
                "Status changed"
            );
        }
    });

    if let Some(path) = &config.watch_file {
        if let Err(err) = distributor.start_watch(path.clone()).await {
            tracing::warn!(path = %path.display(), error = %err, "Failed to watch results file");
        }
    }

    for address in &config.targets {
        if let Err(err) = distributor.add_target(address.clone()).await {
            tracing::warn!(server = %address, error = %err, "Failed to add results server");
        }
    }

    tracing::info!(actions = ?ACTIONS, "Publisher running, press Ctrl+C to stop");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        let mut response = management::handle_line(&distributor, &line).await;
                        response.push('\n');
                        stdout.write_all(response.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    Ok(None) => {
                        tracing::debug!("Stdin closed, management input disabled");
                        stdin_open = false;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to read management input");
                        stdin_open = false;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    distributor.stop().await?;
    task.await?;

    Ok(())
}
