//! HTTP upgrade handshake that turns a plain connection into an RPC channel.
//!
//! Request, byte for byte:
//!
//! ```text
//! CONNECT /api HTTP/1.0\r\n
//! Host: results.example.org\r\n
//! Connection: Upgrade\r\n
//! Upgrade: RPC\r\n
//! Content-Length: <len(secret)>\r\n
//! \r\n
//! <secret>
//! ```
//!
//! Success response: `HTTP/1.0 101 Connected to <service>\r\n\r\n`. Using 101
//! lets the exchange pass through reverse proxies that understand upgrades.

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

/// Default RPC endpoint path.
pub const DEFAULT_RPC_PATH: &str = "/api";

/// Default service name announced in the success status line.
pub const DEFAULT_SERVICE_NAME: &str = "Live Results";

/// Default request method.
pub const DEFAULT_METHOD: &str = "CONNECT";

/// Upper bound on the request or response head, body included.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Handshake parameters shared by both ends of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Shared secret sent as the request body
    pub secret: String,
    /// RPC endpoint path
    pub rpc_path: String,
    /// Service name used in the success status line
    pub service_name: String,
    /// Request method
    pub method: String,
}

impl HandshakeConfig {
    /// Create a configuration with default path, method and service name.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            rpc_path: DEFAULT_RPC_PATH.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            method: DEFAULT_METHOD.to_string(),
        }
    }

    /// Status (code and reason) the server sends on success.
    #[must_use]
    pub fn connected_status(&self) -> String {
        format!("101 Connected to {}", self.service_name)
    }

    /// The full request head and body sent by the client.
    #[must_use]
    pub fn request_bytes(&self, host: &str) -> Vec<u8> {
        let mut request = format!(
            "{} {} HTTP/1.0\r\nHost: {host}\r\nConnection: Upgrade\r\nUpgrade: RPC\r\n\
             Content-Length: {}\r\n\r\n",
            self.method,
            self.rpc_path,
            self.secret.len()
        )
        .into_bytes();
        request.extend_from_slice(self.secret.as_bytes());
        request
    }
}

/// Perform the client side of the handshake.
///
/// The stream is returned wrapped in the buffer used to read the response, so
/// no bytes that arrived after the head are lost.
///
/// # Errors
///
/// Returns [`HandshakeError::UnexpectedStatus`] for any status other than the
/// configured success status, or an I/O error if the connection fails.
pub async fn client_handshake<S>(
    stream: S,
    host: &str,
    config: &HandshakeConfig,
) -> Result<BufReader<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    stream.write_all(&config.request_bytes(host)).await?;
    stream.flush().await?;

    let mut budget = MAX_HEAD_BYTES;
    let status_line = read_head_line(&mut stream, &mut budget).await?;

    // Proxies may rewrite the protocol version; only the status is compared.
    let status = status_line
        .strip_prefix("HTTP/1.0 ")
        .or_else(|| status_line.strip_prefix("HTTP/1.1 "));
    if status != Some(config.connected_status().as_str()) {
        return Err(HandshakeError::UnexpectedStatus(status_line));
    }

    while !read_head_line(&mut stream, &mut budget).await?.is_empty() {}

    tracing::debug!(host, status = %status_line, "RPC handshake accepted");
    Ok(stream)
}

/// Perform the server side of the handshake.
///
/// Rejections are answered with a plain HTTP error before returning, after
/// which the caller should drop the stream.
///
/// # Errors
///
/// Returns the reason the request was rejected, or an I/O error.
pub async fn accept_handshake<S>(
    stream: S,
    config: &HandshakeConfig,
) -> Result<BufReader<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut budget = MAX_HEAD_BYTES;

    let request_line = read_head_line(&mut stream, &mut budget).await?;
    let mut parts = request_line.split(' ');
    let (Some(method), Some(path), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        reject(&mut stream, "400 Bad Request").await;
        return Err(HandshakeError::Malformed(request_line));
    };
    if !version.starts_with("HTTP/1.") {
        reject(&mut stream, "400 Bad Request").await;
        return Err(HandshakeError::Malformed(request_line));
    }
    let (method, path) = (method.to_string(), path.to_string());

    let mut content_length = 0usize;
    loop {
        let line = read_head_line(&mut stream, &mut budget).await?;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let Ok(length) = value.trim().parse::<usize>() else {
                    reject(&mut stream, "400 Bad Request").await;
                    return Err(HandshakeError::Malformed(line));
                };
                content_length = length;
            }
        }
    }

    if method != config.method {
        reject(&mut stream, "405 Method Not Allowed").await;
        return Err(HandshakeError::MethodNotAllowed(method));
    }
    if path != config.rpc_path {
        reject(&mut stream, "404 Not Found").await;
        return Err(HandshakeError::NotFound(path));
    }
    if content_length > budget {
        reject(&mut stream, "413 Payload Too Large").await;
        return Err(HandshakeError::HeadTooLarge);
    }

    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).await?;
    if body != config.secret.as_bytes() {
        reject(&mut stream, "401 Unauthorized").await;
        return Err(HandshakeError::Unauthorized);
    }

    let response = format!("HTTP/1.0 {}\r\n\r\n", config.connected_status());
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(stream)
}

async fn reject<S>(stream: &mut BufReader<S>, status: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response =
        format!("HTTP/1.0 {status}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{status}\n");
    if let Err(err) = stream.write_all(response.as_bytes()).await {
        tracing::debug!(error = %err, "Failed to write handshake rejection");
        return;
    }
    let _ = stream.flush().await;
}

/// Read one CRLF-terminated line of the head, charging it against `budget`.
async fn read_head_line<R>(reader: &mut R, budget: &mut usize) -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = (&mut *reader)
        .take(*budget as u64)
        .read_line(&mut line)
        .await?;

    if read == 0 {
        return Err(if *budget == 0 {
            HandshakeError::HeadTooLarge
        } else {
            HandshakeError::Closed
        });
    }
    *budget -= read;
    if !line.ends_with('\n') {
        return Err(if *budget == 0 {
            HandshakeError::HeadTooLarge
        } else {
            HandshakeError::Closed
        });
    }

    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

/// Errors from either side of the handshake.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandshakeError {
    /// The server answered with something other than the success status
    #[error("unexpected handshake response: {0}")]
    UnexpectedStatus(String),
    /// The shared secret did not match
    #[error("unauthorized: shared secret mismatch")]
    Unauthorized,
    /// The request used the wrong method
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),
    /// The request targeted the wrong path
    #[error("no RPC endpoint at {0}")]
    NotFound(String),
    /// The request or response head could not be parsed
    #[error("malformed handshake line: {0}")]
    Malformed(String),
    /// The head exceeded the size limit
    #[error("handshake head too large")]
    HeadTooLarge,
    /// The peer closed the connection mid-handshake
    #[error("connection closed during handshake")]
    Closed,
    /// The handshake did not complete in time
    #[error("handshake timed out")]
    TimedOut,
    /// I/O failure
    #[error("handshake I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for HandshakeError {
    fn from(err: std::io::Error) -> Self {
        HandshakeError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    const REQUEST: &[u8] = b"CONNECT /api HTTP/1.0\r\nHost: results.example.org\r\n\
        Connection: Upgrade\r\nUpgrade: RPC\r\nContent-Length: 6\r\n\r\nsecret";

    fn rejection(status: &str) -> Vec<u8> {
        format!("HTTP/1.0 {status}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{status}\n")
            .into_bytes()
    }

    #[test]
    fn request_is_byte_exact() {
        let config = HandshakeConfig::new("secret");
        assert_eq!(config.request_bytes("results.example.org"), REQUEST);
    }

    #[tokio::test]
    async fn client_accepts_connected_status() {
        let mock = Builder::new()
            .write(REQUEST)
            .read(b"HTTP/1.0 101 Connected to Live Results\r\n\r\n")
            .build();

        let config = HandshakeConfig::new("secret");
        client_handshake(mock, "results.example.org", &config)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn client_rejects_other_status() {
        let mock = Builder::new()
            .write(REQUEST)
            .read(b"HTTP/1.0 401 Unauthorized\r\nContent-Type: text/plain\r\n\r\n")
            .build();

        let config = HandshakeConfig::new("secret");
        let err = client_handshake(mock, "results.example.org", &config)
            .await
            .unwrap_err();
        let HandshakeError::UnexpectedStatus(status) = err else {
            panic!("expected an unexpected status, got {err:?}");
        };
        assert_eq!(status, "HTTP/1.0 401 Unauthorized");
    }

    #[tokio::test]
    async fn client_rejects_other_service() {
        let mock = Builder::new()
            .write(REQUEST)
            .read(b"HTTP/1.0 101 Connected to Someone Else\r\n\r\n")
            .build();

        let config = HandshakeConfig::new("secret");
        let err = client_handshake(mock, "results.example.org", &config)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedStatus(_)));
    }

    #[tokio::test]
    async fn server_accepts_valid_request() {
        let mock = Builder::new()
            .read(REQUEST)
            .write(b"HTTP/1.0 101 Connected to Live Results\r\n\r\n")
            .build();

        let config = HandshakeConfig::new("secret");
        accept_handshake(mock, &config).await.unwrap();
    }

    #[tokio::test]
    async fn server_rejects_wrong_secret() {
        let mock = Builder::new()
            .read(b"CONNECT /api HTTP/1.0\r\nHost: x\r\nContent-Length: 5\r\n\r\nwrong")
            .write(&rejection("401 Unauthorized"))
            .build();

        let config = HandshakeConfig::new("secret");
        let err = accept_handshake(mock, &config).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Unauthorized));
    }

    #[tokio::test]
    async fn server_rejects_wrong_method_and_path() {
        let config = HandshakeConfig::new("secret");

        let mock = Builder::new()
            .read(b"GET /api HTTP/1.0\r\n\r\n")
            .write(&rejection("405 Method Not Allowed"))
            .build();
        let err = accept_handshake(mock, &config).await.unwrap_err();
        assert!(matches!(err, HandshakeError::MethodNotAllowed(ref m) if m == "GET"));

        let mock = Builder::new()
            .read(b"CONNECT /other HTTP/1.0\r\n\r\n")
            .write(&rejection("404 Not Found"))
            .build();
        let err = accept_handshake(mock, &config).await.unwrap_err();
        assert!(matches!(err, HandshakeError::NotFound(ref p) if p == "/other"));
    }

    #[tokio::test]
    async fn server_rejects_bad_content_length() {
        let mock = Builder::new()
            .read(b"CONNECT /api HTTP/1.0\r\nContent-Length: six\r\n\r\n")
            .write(&rejection("400 Bad Request"))
            .build();

        let config = HandshakeConfig::new("secret");
        let err = accept_handshake(mock, &config).await.unwrap_err();
        assert!(
            matches!(err, HandshakeError::Malformed(ref line) if line == "Content-Length: six")
        );
    }

    #[tokio::test]
    async fn both_sides_agree_over_a_pipe() {
        let (client, server) = duplex(1024);
        let mut config = HandshakeConfig::new("s3cr3t");
        config.service_name = "Otheday".to_string();

        let server_config = config.clone();
        let server = tokio::spawn(async move { accept_handshake(server, &server_config).await });

        client_handshake(client, "localhost", &config).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let (mut client, server) = duplex(64 * 1024);
        let config = HandshakeConfig::new("secret");

        let server = tokio::spawn(async move { accept_handshake(server, &config).await });

        let mut junk = b"CONNECT /api HTTP/1.0\r\nX-Padding: ".to_vec();
        junk.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES));
        junk.extend_from_slice(b"\r\n\r\n");
        client.write_all(&junk).await.unwrap();

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::HeadTooLarge));
    }
}
