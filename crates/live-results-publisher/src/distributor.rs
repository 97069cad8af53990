//! Distribution actor.
//!
//! One task owns the latest snapshot, the set of results servers and the
//! active file watch. Everything else talks to it through a
//! [`DistributorHandle`], so no state is shared and commands are applied in
//! the order they arrive.

use crate::connection::{ConnectionConfig, TargetConnection, TargetHandle};
use crate::source::{FileWatch, SourceError};
use live_results_core::Snapshot;
use live_results_proto::{DialConfig, HandshakeConfig, TargetAddr, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Distributor parameters.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Parameters used for every results server connection
    pub connection: ConnectionConfig,
    /// Poll interval for watched files
    pub poll_interval: Duration,
    /// Capacity of the command queue
    pub command_capacity: usize,
    /// Capacity of the status notification queue
    pub status_capacity: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::new(DialConfig::new(HandshakeConfig::new(""))),
            poll_interval: Duration::from_secs(1),
            command_capacity: 64,
            status_capacity: 16,
        }
    }
}

/// Publicly visible distributor state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WatchStatus {
    /// Path of the watched file, empty when none has been set
    pub watched_file: String,
    /// Whether the file is currently being watched
    pub active_watch: bool,
    /// Registered results servers, sorted
    pub targets: Vec<String>,
}

enum Command {
    GetStatus {
        reply: oneshot::Sender<WatchStatus>,
    },
    RegisterStatusListener {
        listener: mpsc::Sender<WatchStatus>,
        reply: oneshot::Sender<()>,
    },
    StartWatch {
        path: PathBuf,
        reply: oneshot::Sender<Result<(), DistributorError>>,
    },
    StopWatch {
        reply: oneshot::Sender<()>,
    },
    AddTarget {
        address: String,
        reply: oneshot::Sender<Result<(), DistributorError>>,
    },
    RemoveTarget {
        address: String,
        reply: oneshot::Sender<()>,
    },
    NewSnapshot(Snapshot),
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running distributor.
#[derive(Clone)]
pub struct DistributorHandle {
    commands: mpsc::Sender<Command>,
}

impl DistributorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, DistributorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| DistributorError::Stopped)?;
        response.await.map_err(|_| DistributorError::Stopped)
    }

    /// Current status.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::Stopped`] if the distributor has exited.
    pub async fn status(&self) -> Result<WatchStatus, DistributorError> {
        self.request(|reply| Command::GetStatus { reply }).await
    }

    /// Register a channel that receives every status change.
    ///
    /// Status updates are delivered in order. A listener whose queue is full
    /// misses that update; a closed listener is forgotten.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::Stopped`] if the distributor has exited.
    pub async fn register_status_listener(
        &self,
        listener: mpsc::Sender<WatchStatus>,
    ) -> Result<(), DistributorError> {
        self.request(|reply| Command::RegisterStatusListener { listener, reply })
            .await
    }

    /// Watch a results file, replacing any current watch.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::Watch`] if the file cannot be watched, in
    /// which case the previous watch stays in place.
    pub async fn start_watch(&self, path: impl Into<PathBuf>) -> Result<(), DistributorError> {
        let path = path.into();
        self.request(|reply| Command::StartWatch { path, reply })
            .await?
    }

    /// Stop watching. The watched path is remembered.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::Stopped`] if the distributor has exited.
    pub async fn stop_watch(&self) -> Result<(), DistributorError> {
        self.request(|reply| Command::StopWatch { reply }).await
    }

    /// Connect to a results server and register it.
    ///
    /// The latest snapshot, if any, is sent straight away.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::DuplicateTarget`] if the server is already
    /// registered and [`DistributorError::Transport`] if the address is
    /// invalid or the connection fails.
    pub async fn add_target(&self, address: impl Into<String>) -> Result<(), DistributorError> {
        let address = address.into();
        self.request(|reply| Command::AddTarget { address, reply })
            .await?
    }

    /// Deregister a results server. Unknown addresses are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::Stopped`] if the distributor has exited.
    pub async fn remove_target(&self, address: impl Into<String>) -> Result<(), DistributorError> {
        let address = address.into();
        self.request(|reply| Command::RemoveTarget { address, reply })
            .await
    }

    /// Hand a new snapshot to the distributor for fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::Stopped`] if the distributor has exited.
    pub async fn new_snapshot(&self, snapshot: Snapshot) -> Result<(), DistributorError> {
        self.commands
            .send(Command::NewSnapshot(snapshot))
            .await
            .map_err(|_| DistributorError::Stopped)
    }

    /// Stop the distributor, closing every connection.
    ///
    /// Pending status notifications are delivered before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::Stopped`] if the distributor had already exited.
    pub async fn stop(&self) -> Result<(), DistributorError> {
        self.request(|reply| Command::Stop { reply }).await
    }
}

/// The distribution actor.
pub struct Distributor {
    config: DistributorConfig,
    latest: Option<Snapshot>,
    targets: BTreeMap<TargetAddr, TargetHandle>,
    watched_file: Option<PathBuf>,
    watch: Option<FileWatch>,
    notices: Option<mpsc::Sender<Notice>>,
}

impl Distributor {
    /// Start a distributor on its own task.
    #[must_use]
    pub fn spawn(config: DistributorConfig) -> (DistributorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let distributor = Self {
            config,
            latest: None,
            targets: BTreeMap::new(),
            watched_file: None,
            watch: None,
            notices: None,
        };
        let task = tokio::spawn(distributor.run(rx));
        (DistributorHandle { commands: tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (notices, notifier) = spawn_notifier(self.config.status_capacity.max(1));
        self.notices = Some(notices);
        tracing::info!("Distributor started");

        let stop_reply = loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Stop { reply }) => break Some(reply),
                        Some(command) => self.handle(command).await,
                        None => break None,
                    }
                }
                update = next_watched(&mut self.watch) => {
                    match update {
                        Some(snapshot) => self.on_new_snapshot(snapshot),
                        None => {
                            tracing::warn!("File watch ended unexpectedly");
                            self.watch = None;
                            self.publish_status();
                        }
                    }
                }
            }
        };

        self.watch = None;
        self.targets.clear();
        self.notices = None;
        if let Err(err) = notifier.await {
            tracing::warn!(error = %err, "Status notifier failed");
        }
        tracing::info!("Distributor stopped");

        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::GetStatus { reply } => {
                let _ = reply.send(self.status());
            }
            Command::RegisterStatusListener { listener, reply } => {
                if let Some(notices) = &self.notices {
                    if notices.send(Notice::Register(listener)).await.is_err() {
                        tracing::warn!("Status notifier has stopped");
                    }
                }
                let _ = reply.send(());
            }
            Command::StartWatch { path, reply } => {
                let _ = reply.send(self.start_watch(path));
            }
            Command::StopWatch { reply } => {
                if self.watch.take().is_some() {
                    tracing::info!("Stopped watching results file");
                    self.publish_status();
                }
                let _ = reply.send(());
            }
            Command::AddTarget { address, reply } => {
                let _ = reply.send(self.add_target(&address).await);
            }
            Command::RemoveTarget { address, reply } => {
                self.remove_target(&address);
                let _ = reply.send(());
            }
            Command::NewSnapshot(snapshot) => self.on_new_snapshot(snapshot),
            Command::Stop { .. } => {}
        }
    }

    fn start_watch(&mut self, path: PathBuf) -> Result<(), DistributorError> {
        let watch = FileWatch::start(path.clone(), self.config.poll_interval)?;
        self.watch = Some(watch);
        self.watched_file = Some(path);
        self.publish_status();
        Ok(())
    }

    async fn add_target(&mut self, address: &str) -> Result<(), DistributorError> {
        let addr = TargetAddr::parse(address)?;
        if self.targets.contains_key(&addr) {
            return Err(DistributorError::DuplicateTarget(addr.to_string()));
        }

        let mut connection = TargetConnection::new(addr.clone(), self.config.connection.clone());
        connection.connect().await?;
        tracing::info!(server = %addr, "Results server added");

        let handle = connection.spawn();
        if let Some(latest) = &self.latest {
            handle.submit(latest.clone());
        }
        self.targets.insert(addr, handle);
        self.publish_status();
        Ok(())
    }

    fn remove_target(&mut self, address: &str) {
        let Ok(addr) = TargetAddr::parse(address) else {
            return;
        };
        if self.targets.remove(&addr).is_some() {
            tracing::info!(server = %addr, "Results server removed");
            self.publish_status();
        }
    }

    fn on_new_snapshot(&mut self, snapshot: Snapshot) {
        if self.latest.as_ref() == Some(&snapshot) {
            tracing::debug!(hash = snapshot.hash(), "Snapshot unchanged, not distributing");
            return;
        }

        tracing::info!(
            hash = snapshot.hash(),
            targets = self.targets.len(),
            "Distributing snapshot"
        );
        for (addr, target) in &self.targets {
            if !target.submit(snapshot.clone()) {
                tracing::warn!(server = %addr, "Target worker has exited");
            }
        }
        self.latest = Some(snapshot);
    }

    fn status(&self) -> WatchStatus {
        WatchStatus {
            watched_file: self
                .watched_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            active_watch: self.watch.is_some(),
            targets: self.targets.keys().map(ToString::to_string).collect(),
        }
    }

    fn publish_status(&self) {
        let Some(notices) = &self.notices else {
            return;
        };
        match notices.try_send(Notice::Status(self.status())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Status notification queue full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Status notifier has stopped");
            }
        }
    }
}

async fn next_watched(watch: &mut Option<FileWatch>) -> Option<Snapshot> {
    match watch {
        Some(watch) => watch.next_snapshot().await,
        None => std::future::pending().await,
    }
}

enum Notice {
    Register(mpsc::Sender<WatchStatus>),
    Status(WatchStatus),
}

/// Fan status changes out to listeners without blocking the actor.
fn spawn_notifier(capacity: usize) -> (mpsc::Sender<Notice>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity);
    let task = tokio::spawn(async move {
        let mut listeners: Vec<mpsc::Sender<WatchStatus>> = Vec::new();
        while let Some(notice) = rx.recv().await {
            match notice {
                Notice::Register(listener) => listeners.push(listener),
                Notice::Status(status) => {
                    listeners.retain(|listener| match listener.try_send(status.clone()) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!("Status listener is lagging, update dropped");
                            true
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    });
                }
            }
        }
    });
    (tx, task)
}

/// Errors returned by distributor commands.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DistributorError {
    /// The results server is already registered
    #[error("results server already registered: {0}")]
    DuplicateTarget(String),
    /// The address is invalid or the server could not be reached
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The file could not be watched
    #[error(transparent)]
    Watch(#[from] SourceError),
    /// The distributor has exited
    #[error("distributor has stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use live_results_core::{Competitor, Course, Results};
    use live_results_proto::{Call, RpcResponse, RpcServerConnection};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    const SECRET: &str = "s3cret";

    fn config() -> DistributorConfig {
        DistributorConfig {
            connection: ConnectionConfig::new(DialConfig::new(HandshakeConfig::new(SECRET))),
            poll_interval: Duration::from_millis(20),
            ..DistributorConfig::default()
        }
    }

    /// Loopback results server that accepts everything and records each call.
    async fn recording_server() -> (String, Arc<Mutex<Vec<Call>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let recorded = calls.clone();
        tokio::spawn(async move {
            let handshake = HandshakeConfig::new(SECRET);
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = recorded.clone();
                let handshake = handshake.clone();
                tokio::spawn(async move {
                    let Ok(mut conn) = RpcServerConnection::accept(stream, &handshake).await else {
                        return;
                    };
                    while let Some(Ok(request)) = conn.next_request().await {
                        recorded.lock().unwrap().push(request.call);
                        if conn.respond(&RpcResponse::reply(request.id, true)).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (format!("127.0.0.1:{port}"), calls)
    }

    async fn wait_for_calls(calls: &Arc<Mutex<Vec<Call>>>, count: usize) {
        for _ in 0..250 {
            if calls.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} calls, got {}", calls.lock().unwrap().len());
    }

    fn snapshot(title: &str, names: &[&str]) -> Snapshot {
        let competitors = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                Competitor::new(*name, "SYO", Duration::from_secs(600 + i as u64), true)
            })
            .collect();
        Snapshot::new(Results::new(
            title,
            vec![Course::new("Men Elite", "2.9km", competitors)],
        ))
    }

    #[tokio::test]
    async fn status_starts_empty() {
        let (handle, task) = Distributor::spawn(config());
        assert_eq!(handle.status().await.unwrap(), WatchStatus::default());

        handle.stop().await.unwrap();
        task.await.unwrap();
        assert!(matches!(handle.status().await, Err(DistributorError::Stopped)));
    }

    #[tokio::test]
    async fn add_target_rejects_duplicates_and_bad_addresses() {
        let (address, _calls) = recording_server().await;
        let (handle, _task) = Distributor::spawn(config());

        handle.add_target(address.clone()).await.unwrap();
        assert!(matches!(
            handle.add_target(address.clone()).await,
            Err(DistributorError::DuplicateTarget(_))
        ));
        assert!(matches!(
            handle.add_target("127.0.0.1:notaport").await,
            Err(DistributorError::Transport(TransportError::InvalidAddress(_)))
        ));
        assert_eq!(handle.status().await.unwrap().targets, vec![address.clone()]);

        handle.remove_target(address).await.unwrap();
        handle.remove_target("never-added.example.org").await.unwrap();
        assert!(handle.status().await.unwrap().targets.is_empty());
    }

    #[tokio::test]
    async fn unreachable_target_is_not_registered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (handle, _task) = Distributor::spawn(config());
        let result = handle.add_target(format!("127.0.0.1:{port}")).await;
        assert!(matches!(result, Err(DistributorError::Transport(_))));
        assert!(handle.status().await.unwrap().targets.is_empty());
    }

    #[tokio::test]
    async fn snapshots_fan_out_as_full_then_delta() {
        let (first, first_calls) = recording_server().await;
        let (second, second_calls) = recording_server().await;
        let (handle, _task) = Distributor::spawn(config());

        let a = snapshot("Sprint", &["Alice", "Bob"]);
        let b = snapshot("Sprint", &["Alice", "Carol"]);

        handle.add_target(first).await.unwrap();
        handle.new_snapshot(a.clone()).await.unwrap();
        wait_for_calls(&first_calls, 1).await;

        // A target added later is brought up to date with the latest snapshot.
        handle.add_target(second).await.unwrap();
        wait_for_calls(&second_calls, 1).await;

        handle.new_snapshot(b.clone()).await.unwrap();
        // Identical snapshots are not redistributed.
        handle.new_snapshot(b.clone()).await.unwrap();
        wait_for_calls(&first_calls, 2).await;
        wait_for_calls(&second_calls, 2).await;

        for calls in [&first_calls, &second_calls] {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0], Call::SubmitLatestResults(a.clone()));
            let Call::SubmitDelta(delta) = &calls[1] else {
                panic!("expected a delta");
            };
            assert_eq!(delta.apply_to(&a).unwrap(), b);
        }
    }

    #[tokio::test]
    async fn no_submission_without_snapshot() {
        let (address, calls) = recording_server().await;
        let (handle, _task) = Distributor::spawn(config());

        handle.add_target(address).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn listeners_see_status_changes_in_order() {
        let (address, _calls) = recording_server().await;
        let (handle, task) = Distributor::spawn(config());
        let (tx, mut rx) = mpsc::channel(8);
        handle.register_status_listener(tx).await.unwrap();

        handle.add_target(address.clone()).await.unwrap();
        handle.remove_target(address.clone()).await.unwrap();
        handle.stop().await.unwrap();
        task.await.unwrap();

        let added = rx.recv().await.unwrap();
        assert_eq!(added.targets, vec![address]);
        let removed = rx.recv().await.unwrap();
        assert!(removed.targets.is_empty());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stuck_listener_does_not_stall_commands() {
        let (address, _calls) = recording_server().await;
        let (handle, _task) = Distributor::spawn(config());
        let (tx, mut rx) = mpsc::channel(1);
        handle.register_status_listener(tx).await.unwrap();

        let cycles = async {
            for _ in 0..40 {
                handle.add_target(address.clone()).await.unwrap();
                handle.remove_target(address.clone()).await.unwrap();
            }
            handle.status().await.unwrap()
        };
        let status = tokio::time::timeout(Duration::from_secs(10), cycles)
            .await
            .expect("commands stalled behind a full status listener");
        assert!(status.targets.is_empty());

        // The listener kept only the first update it had room for.
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.targets, vec![address]);
    }

    #[tokio::test]
    async fn watch_start_failure_keeps_previous_watch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, r#"{"Title": "Sprint", "Courses": []}"#).unwrap();

        let (handle, _task) = Distributor::spawn(config());
        handle.start_watch(&path).await.unwrap();

        let result = handle.start_watch(dir.path().join("missing.json")).await;
        assert!(matches!(result, Err(DistributorError::Watch(SourceError::NotFound(_)))));

        let status = handle.status().await.unwrap();
        assert!(status.active_watch);
        assert_eq!(status.watched_file, path.display().to_string());

        handle.stop_watch().await.unwrap();
        let status = handle.status().await.unwrap();
        assert!(!status.active_watch);
        assert_eq!(status.watched_file, path.display().to_string());
    }

    #[tokio::test]
    async fn watched_file_is_distributed() {
        let (address, calls) = recording_server().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, r#"{"Title": "Sprint", "Courses": []}"#).unwrap();

        let (handle, _task) = Distributor::spawn(config());
        handle.add_target(address).await.unwrap();
        handle.start_watch(&path).await.unwrap();

        wait_for_calls(&calls, 1).await;
        let calls = calls.lock().unwrap();
        let Call::SubmitLatestResults(snapshot) = &calls[0] else {
            panic!("expected a full snapshot");
        };
        assert_eq!(snapshot.results().title, "Sprint");
    }
}
