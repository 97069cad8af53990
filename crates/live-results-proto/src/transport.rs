//! Dialing, TLS, and length-prefixed CBOR framing for the RPC channel.

use crate::handshake::{accept_handshake, client_handshake, HandshakeConfig, HandshakeError};
use crate::messages::{Call, MessageError, RpcRequest, RpcResponse};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Port on which targets are reached over TLS.
pub const SECURE_PORT: u16 = 443;

/// Port used when a target address omits one.
pub const DEFAULT_PORT: u16 = 80;

/// A bidirectional byte stream usable as an RPC channel.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// A remote results server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetAddr {
    host: String,
    port: u16,
}

impl TargetAddr {
    /// Parse `host`, `host:port`, or `[v6addr]:port`.
    ///
    /// # Errors
    ///
    /// Returns error if the host is empty or the port is invalid.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let input = input.trim();
        let (host, port) = match input.rsplit_once(':') {
            Some((host, port)) if !port.contains(']') => {
                let port = port.parse().map_err(|_| {
                    TransportError::InvalidAddress(format!("{input}: invalid port '{port}'"))
                })?;
                (host, port)
            }
            _ => (input, DEFAULT_PORT),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(format!(
                "{input}: missing host"
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the connection is TLS-wrapped.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.port == SECURE_PORT
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parameters for establishing an RPC connection.
#[derive(Debug, Clone)]
pub struct DialConfig {
    /// Handshake parameters
    pub handshake: HandshakeConfig,
    /// Bound on the TCP connect
    pub connect_timeout: Duration,
    /// Bound on TLS setup plus the upgrade handshake
    pub handshake_timeout: Duration,
}

impl DialConfig {
    /// Create a dial configuration with default timeouts.
    #[must_use]
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Connect to a target and complete the upgrade handshake.
///
/// # Errors
///
/// Returns [`TransportError::Dial`] if the TCP or TLS connection cannot be
/// established and [`TransportError::Handshake`] if the server does not accept
/// the upgrade.
pub async fn dial(addr: &TargetAddr, config: &DialConfig) -> Result<RpcClient, TransportError> {
    let tcp = timeout(
        config.connect_timeout,
        TcpStream::connect((addr.host(), addr.port())),
    )
    .await
    .map_err(|_| TransportError::Dial(format!("{addr}: connect timed out")))?
    .map_err(|e| TransportError::Dial(format!("{addr}: {e}")))?;
    tcp.set_nodelay(true)
        .map_err(|e| TransportError::Dial(format!("{addr}: {e}")))?;

    let upgrade = async {
        let stream: BoxedStream = if addr.is_secure() {
            Box::new(tls_connect(tcp, addr.host()).await?)
        } else {
            Box::new(tcp)
        };
        let stream = client_handshake(stream, addr.host(), &config.handshake).await?;
        Ok::<_, TransportError>(stream)
    };

    let stream = timeout(config.handshake_timeout, upgrade)
        .await
        .map_err(|_| TransportError::Handshake(HandshakeError::TimedOut))??;

    tracing::info!(server = %addr, secure = addr.is_secure(), "Connected to results server");
    Ok(RpcClient::new(stream))
}

async fn tls_connect(
    tcp: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Dial(format!("{host}: invalid TLS server name: {e}")))?;

    TlsConnector::from(Arc::new(tls_config))
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::Dial(format!("{host}: TLS error: {e}")))
}

/// Client end of an RPC channel.
///
/// Calls are strictly sequential: each waits for its own response before the
/// next request is written. Dropping the client closes the connection, which
/// also abandons any call still in flight.
pub struct RpcClient {
    framed: Framed<BoxedStream, LengthDelimitedCodec>,
    next_id: u64,
}

impl RpcClient {
    /// Wrap an already-upgraded stream.
    pub fn new<S: AsyncStream + 'static>(stream: S) -> Self {
        let stream: BoxedStream = Box::new(stream);
        Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            next_id: 0,
        }
    }

    /// Perform a call and wait for its boolean reply.
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails, the response cannot be decoded,
    /// or the server reports an error instead of a reply.
    pub async fn call(&mut self, call: &Call) -> Result<bool, TransportError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = RpcRequest::encode(id, call)?;
        tracing::debug!(id, method = call.method(), bytes = request.len(), "Sending RPC request");
        self.framed.send(Bytes::from(request)).await?;

        let frame = self.framed.next().await.ok_or(TransportError::Closed)??;
        let response = RpcResponse::from_cbor(&frame)?;
        if response.id != id {
            return Err(TransportError::Protocol(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }

        response.into_result().map_err(TransportError::Remote)
    }
}

/// Server end of an RPC channel.
pub struct RpcServerConnection {
    framed: Framed<BoxedStream, LengthDelimitedCodec>,
}

impl RpcServerConnection {
    /// Wrap an already-upgraded stream.
    pub fn new<S: AsyncStream + 'static>(stream: S) -> Self {
        let stream: BoxedStream = Box::new(stream);
        Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    /// Accept the upgrade handshake on a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns the handshake failure; the rejection has already been sent.
    pub async fn accept<S: AsyncStream + 'static>(
        stream: S,
        config: &HandshakeConfig,
    ) -> Result<Self, HandshakeError> {
        let stream = accept_handshake(stream, config).await?;
        Ok(Self::new(stream))
    }

    /// Wait for the next request. Returns `None` once the client hangs up.
    ///
    /// # Errors
    ///
    /// Returns error if the frame cannot be read or decoded.
    pub async fn next_request(&mut self) -> Option<Result<RpcRequest, TransportError>> {
        let frame = match self.framed.next().await? {
            Ok(frame) => frame,
            Err(err) => return Some(Err(err.into())),
        };
        Some(RpcRequest::from_cbor(&frame).map_err(TransportError::from))
    }

    /// Send a response.
    ///
    /// # Errors
    ///
    /// Returns error if the frame cannot be encoded or written.
    pub async fn respond(&mut self, response: &RpcResponse) -> Result<(), TransportError> {
        let bytes = response.to_cbor()?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }
}

/// Errors for the RPC transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established
    #[error("dial failed: {0}")]
    Dial(String),
    /// The upgrade handshake failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// The peer closed the connection
    #[error("connection closed")]
    Closed,
    /// Read or write failure
    #[error("I/O error: {0}")]
    Io(String),
    /// A frame could not be encoded or decoded
    #[error(transparent)]
    Message(#[from] MessageError),
    /// The peer violated the framing protocol
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server failed to execute the call
    #[error("remote error: {0}")]
    Remote(String),
    /// The target address could not be parsed
    #[error("invalid target address: {0}")]
    InvalidAddress(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}
