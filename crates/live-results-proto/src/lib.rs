//! # Live Results Protocol
//!
//! Transport between a results publisher and remote results servers.
//!
//! ## Handshake
//!
//! The publisher opens a TCP connection (TLS on port 443) and sends a plain
//! HTTP/1.0 upgrade request whose body is the shared secret. The server replies
//! `HTTP/1.0 101 Connected to <service>` and from then on the socket carries
//! RPC frames only.
//!
//! ## RPC
//!
//! - `SubmitLatestResults(Snapshot) -> bool`
//! - `SubmitDelta(Delta) -> bool`
//!
//! Frames are length-prefixed CBOR documents.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handshake;
pub mod messages;
pub mod transport;

pub use handshake::{HandshakeConfig, HandshakeError};
pub use messages::{Call, MessageError, RpcRequest, RpcResponse};
pub use transport::{dial, DialConfig, RpcClient, RpcServerConnection, TargetAddr, TransportError};
