//! Results server binary.

use anyhow::{Context, Result};
use live_results_receiver::{BroadcastSink, ReceiverConfig, ResultsReceiver, RpcServer};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting live results receiver"
    );

    let config = ReceiverConfig::from_env()?;

    let sink = BroadcastSink::new(config.broadcast_capacity);
    let mut updates = sink.subscribe();
    let (receiver, task) = ResultsReceiver::spawn(sink);

    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    let results = update.snapshot.results();
                    tracing::info!(
                        hash = update.snapshot.hash(),
                        title = %results.title,
                        courses = results.courses.len(),
                        delta = update.delta.is_some(),
                        "Results updated"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Results log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let server = RpcServer::bind(config.listen.as_str(), config.server(), receiver.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;

    tokio::select! {
        () = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    receiver.stop().await?;
    task.await?;

    Ok(())
}
