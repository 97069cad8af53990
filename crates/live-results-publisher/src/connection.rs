//! Per-target connection management.
//!
//! Each results server gets a [`TargetConnection`] that owns the RPC client
//! and the last snapshot the server acknowledged. The baseline decides
//! whether the next submission is a delta or a full snapshot.

use live_results_core::{Delta, Snapshot};
use live_results_proto::{dial, Call, DialConfig, RpcClient, TargetAddr, TransportError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Connection parameters shared by all targets.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Dial and handshake parameters
    pub dial: DialConfig,
    /// Bound on each RPC round trip
    pub rpc_timeout: Duration,
}

impl ConnectionConfig {
    /// Create a configuration with the default RPC timeout of 5 seconds.
    #[must_use]
    pub fn new(dial: DialConfig) -> Self {
        Self {
            dial,
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

/// What happened to a single submission.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The server accepted the call; the snapshot is the new baseline
    Committed,
    /// The server replied `false`; the next submission will be a full snapshot
    Rejected,
    /// No reply within the RPC timeout; the connection was dropped
    TimedOut,
    /// The call failed; the connection was dropped
    Failed(TransportError),
    /// No connection could be established
    DialFailed(TransportError),
}

impl SubmitOutcome {
    /// Whether the server acknowledged the submission.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, SubmitOutcome::Committed)
    }
}

/// Connection state for one results server.
pub struct TargetConnection {
    addr: TargetAddr,
    config: ConnectionConfig,
    client: Option<RpcClient>,
    baseline: Option<Snapshot>,
}

impl TargetConnection {
    /// Create a disconnected target.
    #[must_use]
    pub fn new(addr: TargetAddr, config: ConnectionConfig) -> Self {
        Self {
            addr,
            config,
            client: None,
            baseline: None,
        }
    }

    /// Target address.
    #[must_use]
    pub fn addr(&self) -> &TargetAddr {
        &self.addr
    }

    /// Whether a connection is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// The snapshot the server last acknowledged, if any.
    #[must_use]
    pub fn baseline(&self) -> Option<&Snapshot> {
        self.baseline.as_ref()
    }

    /// Open the connection now instead of on the first submission.
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot be reached or refuses the handshake.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.client.is_none() {
            self.client = Some(dial(&self.addr, &self.config.dial).await?);
        }
        Ok(())
    }

    /// Deliver a snapshot, as a delta against the baseline when there is one.
    ///
    /// Reconnects first if the previous connection was dropped. Any failure
    /// other than an explicit `false` reply closes the connection but leaves
    /// the baseline untouched.
    pub async fn submit(&mut self, snapshot: Snapshot) -> SubmitOutcome {
        let mut client = match self.client.take() {
            Some(client) => client,
            None => match dial(&self.addr, &self.config.dial).await {
                Ok(client) => client,
                Err(err) => {
                    tracing::warn!(
                        server = %self.addr,
                        error = %err,
                        "Failed to connect to results server"
                    );
                    return SubmitOutcome::DialFailed(err);
                }
            },
        };

        let call = match &self.baseline {
            Some(baseline) => Call::SubmitDelta(Delta::encode(baseline, &snapshot)),
            None => Call::SubmitLatestResults(snapshot.clone()),
        };

        match tokio::time::timeout(self.config.rpc_timeout, client.call(&call)).await {
            Ok(Ok(true)) => {
                tracing::debug!(
                    server = %self.addr,
                    method = call.method(),
                    hash = snapshot.hash(),
                    "Submission committed"
                );
                self.client = Some(client);
                self.baseline = Some(snapshot);
                SubmitOutcome::Committed
            }
            Ok(Ok(false)) => {
                tracing::info!(
                    server = %self.addr,
                    method = call.method(),
                    "Submission rejected, next update will be a full snapshot"
                );
                self.client = Some(client);
                self.baseline = None;
                SubmitOutcome::Rejected
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    server = %self.addr,
                    error = %err,
                    "Submission failed, closing connection"
                );
                SubmitOutcome::Failed(err)
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.addr,
                    timeout = ?self.config.rpc_timeout,
                    "Submission timed out, closing connection"
                );
                SubmitOutcome::TimedOut
            }
        }
    }

    /// Move this target onto its own task.
    ///
    /// Submissions run one at a time in the order they were queued. A
    /// submission queued while another is in flight replaces any earlier one
    /// that has not started yet, so a slow target only ever catches up to the
    /// newest snapshot.
    #[must_use]
    pub fn spawn(mut self) -> TargetHandle {
        let (tx, mut rx) = watch::channel::<Option<Snapshot>>(None);
        let addr = self.addr.clone();

        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let latest = rx.borrow_and_update().clone();
                let Some(snapshot) = latest else {
                    continue;
                };
                let hash = snapshot.hash();
                let outcome = self.submit(snapshot).await;
                tracing::debug!(server = %self.addr, hash, ?outcome, "Submission finished");
            }
            tracing::debug!(server = %self.addr, "Target worker stopped");
        });

        TargetHandle { addr, tx, task }
    }
}

/// Handle to a target running on its own task.
///
/// Dropping the handle stops the worker and closes its connection.
pub struct TargetHandle {
    addr: TargetAddr,
    tx: watch::Sender<Option<Snapshot>>,
    task: JoinHandle<()>,
}

impl TargetHandle {
    /// Target address.
    #[must_use]
    pub fn addr(&self) -> &TargetAddr {
        &self.addr
    }

    /// Queue a snapshot for delivery, replacing any queued snapshot that has
    /// not been picked up yet. Returns `false` if the worker has exited.
    pub fn submit(&self, snapshot: Snapshot) -> bool {
        self.tx.send(Some(snapshot)).is_ok()
    }
}

impl Drop for TargetHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
