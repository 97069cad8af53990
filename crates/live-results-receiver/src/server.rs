//! RPC server feeding the receiver actor.

use crate::actor::{ReceiverError, ReceiverHandle};
use live_results_proto::{Call, HandshakeConfig, RpcResponse, RpcServerConnection};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

/// Server parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Handshake parameters publishers must match
    pub handshake: HandshakeConfig,
    /// Bound on reading and answering the upgrade request
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    /// Create a configuration with a 10 second handshake timeout.
    #[must_use]
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Accepts publisher connections and serves their calls.
pub struct RpcServer {
    listener: TcpListener,
    config: ServerConfig,
    receiver: ReceiverHandle,
}

impl RpcServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: ServerConfig,
        receiver: ReceiverHandle,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config,
            receiver,
        })
    }

    /// Address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is cancelled.
    ///
    /// Each connection is served on its own task.
    pub async fn run(self) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Results server listening");
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let config = self.config.clone();
                    let receiver = self.receiver.clone();
                    tokio::spawn(handle_connection(stream, peer, config, receiver));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: ServerConfig,
    receiver: ReceiverHandle,
) {
    let accepted = tokio::time::timeout(
        config.handshake_timeout,
        RpcServerConnection::accept(stream, &config.handshake),
    )
    .await;

    let mut conn = match accepted {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => {
            tracing::warn!(%peer, error = %err, "Rejected connection");
            return;
        }
        Err(_) => {
            tracing::warn!(%peer, "Handshake timed out");
            return;
        }
    };
    tracing::info!(%peer, "Handling RPC connection");

    while let Some(request) = conn.next_request().await {
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "Failed to read request, closing connection");
                return;
            }
        };

        let method = request.call.method();
        let outcome = match request.call {
            Call::SubmitLatestResults(snapshot) => receiver.submit_full(snapshot).await,
            Call::SubmitDelta(delta) => receiver.submit_delta(delta).await,
        };

        let response = match outcome {
            Ok(()) => RpcResponse::reply(request.id, true),
            Err(ReceiverError::Rejected(err)) => {
                tracing::debug!(%peer, method, error = %err, "Replying false");
                RpcResponse::reply(request.id, false)
            }
            Err(err @ ReceiverError::Stopped) => RpcResponse::error(request.id, err.to_string()),
        };

        if let Err(err) = conn.respond(&response).await {
            tracing::warn!(%peer, error = %err, "Failed to send response, closing connection");
            return;
        }
    }

    tracing::info!(%peer, "Publisher disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{BroadcastSink, ResultsReceiver};
    use live_results_core::{Competitor, Course, Delta, Results, Snapshot};
    use live_results_proto::{dial, DialConfig, TargetAddr, TransportError};

    const SECRET: &str = "s3cret";

    async fn start() -> (TargetAddr, ReceiverHandle) {
        let (receiver, _task) = ResultsReceiver::spawn(BroadcastSink::new(8));
        let server = RpcServer::bind(
            "127.0.0.1:0",
            ServerConfig::new(HandshakeConfig::new(SECRET)),
            receiver.clone(),
        )
        .await
        .unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(server.run());
        (TargetAddr::parse(&format!("127.0.0.1:{port}")).unwrap(), receiver)
    }

    fn snapshot(names: &[&str]) -> Snapshot {
        let competitors = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                Competitor::new(*name, "SYO", Duration::from_secs(600 + i as u64), true)
            })
            .collect();
        Snapshot::new(Results::new(
            "Sprint",
            vec![Course::new("Men Elite", "2.9km", competitors)],
        ))
    }

    #[tokio::test]
    async fn submissions_map_to_replies() {
        let (addr, receiver) = start().await;
        let mut client = dial(&addr, &DialConfig::new(HandshakeConfig::new(SECRET)))
            .await
            .unwrap();

        let a = snapshot(&["Alice", "Bob"]);
        let b = snapshot(&["Alice", "Carol"]);

        assert!(client.call(&Call::SubmitLatestResults(a.clone())).await.unwrap());
        assert!(client.call(&Call::SubmitDelta(Delta::encode(&a, &b))).await.unwrap());
        assert_eq!(receiver.current().await.unwrap(), b);

        // Delta against a snapshot the server no longer holds.
        assert!(!client.call(&Call::SubmitDelta(Delta::encode(&a, &b))).await.unwrap());
        assert_eq!(receiver.current().await.unwrap(), b);
    }

    #[tokio::test]
    async fn several_publishers_share_one_receiver() {
        let (addr, receiver) = start().await;
        let config = DialConfig::new(HandshakeConfig::new(SECRET));
        let mut first = dial(&addr, &config).await.unwrap();
        let mut second = dial(&addr, &config).await.unwrap();

        let a = snapshot(&["Alice"]);
        let b = snapshot(&["Bob"]);
        assert!(first.call(&Call::SubmitLatestResults(a)).await.unwrap());
        assert!(second.call(&Call::SubmitLatestResults(b.clone())).await.unwrap());
        assert_eq!(receiver.current().await.unwrap(), b);
    }

    #[tokio::test]
    async fn wrong_secret_is_refused() {
        let (addr, _receiver) = start().await;
        let result = dial(&addr, &DialConfig::new(HandshakeConfig::new("guess"))).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn stopped_receiver_reports_error() {
        let (addr, receiver) = start().await;
        let mut client = dial(&addr, &DialConfig::new(HandshakeConfig::new(SECRET)))
            .await
            .unwrap();
        receiver.stop().await.unwrap();

        let result = client.call(&Call::SubmitLatestResults(snapshot(&["Alice"]))).await;
        assert!(matches!(result, Err(TransportError::Remote(_))));
    }
}
