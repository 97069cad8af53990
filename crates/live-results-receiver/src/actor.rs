//! Receiver actor.
//!
//! Holds the results currently being shown and applies incoming submissions
//! to them one at a time.

use live_results_core::{Delta, DeltaError, Snapshot};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Consumer of every committed snapshot.
///
/// `delta` is the delta that produced the snapshot, or `None` when a full
/// snapshot replaced the previous one.
pub trait ResultsSink: Send + 'static {
    /// Called after each commit, in commit order.
    fn publish(&mut self, snapshot: &Snapshot, delta: Option<&Delta>);
}

/// A committed update as seen by [`BroadcastSink`] subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// The new current snapshot
    pub snapshot: Snapshot,
    /// The delta that produced it, `None` for full submissions
    pub delta: Option<Delta>,
}

/// Sink that forwards commits to a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Published>,
}

impl BroadcastSink {
    /// Create a sink whose subscribers can lag by up to `capacity` updates.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future commits.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }
}

impl ResultsSink for BroadcastSink {
    fn publish(&mut self, snapshot: &Snapshot, delta: Option<&Delta>) {
        // No subscribers is not an error.
        let _ = self.tx.send(Published {
            snapshot: snapshot.clone(),
            delta: delta.cloned(),
        });
    }
}

enum Command {
    SubmitFull {
        snapshot: Snapshot,
        reply: oneshot::Sender<()>,
    },
    SubmitDelta {
        delta: Delta,
        reply: oneshot::Sender<Result<(), ReceiverError>>,
    },
    Current {
        reply: oneshot::Sender<Snapshot>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running receiver.
#[derive(Clone)]
pub struct ReceiverHandle {
    commands: mpsc::Sender<Command>,
}

impl ReceiverHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ReceiverError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ReceiverError::Stopped)?;
        response.await.map_err(|_| ReceiverError::Stopped)
    }

    /// Replace the current results.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Stopped`] if the receiver has exited.
    pub async fn submit_full(&self, snapshot: Snapshot) -> Result<(), ReceiverError> {
        self.request(|reply| Command::SubmitFull { snapshot, reply })
            .await
    }

    /// Apply a delta to the current results.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Rejected`] if the delta does not apply to the
    /// current results, which are then left unchanged.
    pub async fn submit_delta(&self, delta: Delta) -> Result<(), ReceiverError> {
        self.request(|reply| Command::SubmitDelta { delta, reply })
            .await?
    }

    /// The current results.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Stopped`] if the receiver has exited.
    pub async fn current(&self) -> Result<Snapshot, ReceiverError> {
        self.request(|reply| Command::Current { reply }).await
    }

    /// Stop the receiver.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Stopped`] if the receiver had already exited.
    pub async fn stop(&self) -> Result<(), ReceiverError> {
        self.request(|reply| Command::Stop { reply }).await
    }
}

/// The receiver actor.
pub struct ResultsReceiver<S> {
    current: Snapshot,
    sink: S,
}

impl<S: ResultsSink> ResultsReceiver<S> {
    /// Start a receiver on its own task, initially holding empty results.
    #[must_use]
    pub fn spawn(sink: S) -> (ReceiverHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let receiver = Self {
            current: Snapshot::default(),
            sink,
        };
        let task = tokio::spawn(receiver.run(rx));
        (ReceiverHandle { commands: tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::SubmitFull { snapshot, reply } => {
                    self.commit_full(snapshot);
                    let _ = reply.send(());
                }
                Command::SubmitDelta { delta, reply } => {
                    let _ = reply.send(self.commit_delta(delta));
                }
                Command::Current { reply } => {
                    let _ = reply.send(self.current.clone());
                }
                Command::Stop { reply } => {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        tracing::info!(hash = self.current.hash(), "Receiver stopped");
    }

    fn commit_full(&mut self, snapshot: Snapshot) {
        tracing::info!(
            hash = snapshot.hash(),
            title = %snapshot.results().title,
            "Received results"
        );
        self.current = snapshot;
        self.sink.publish(&self.current, None);
    }

    fn commit_delta(&mut self, delta: Delta) -> Result<(), ReceiverError> {
        match delta.apply_to(&self.current) {
            Ok(snapshot) => {
                tracing::info!(
                    base_hash = delta.base_hash,
                    hash = snapshot.hash(),
                    "Received results delta"
                );
                self.current = snapshot;
                self.sink.publish(&self.current, Some(&delta));
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "Rejected results delta");
                Err(err.into())
            }
        }
    }
}

/// Errors returned by receiver commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReceiverError {
    /// The delta does not apply to the current results
    #[error("delta rejected: {0}")]
    Rejected(#[from] DeltaError),
    /// The receiver has exited
    #[error("receiver has stopped")]
    Stopped,
}
