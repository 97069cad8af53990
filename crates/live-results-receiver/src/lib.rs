//! # Live Results Receiver
//!
//! The results-server end of live results sync. Publishers connect over the
//! upgrade handshake and submit full snapshots or deltas; a single actor
//! applies them in arrival order and hands every committed snapshot to a
//! [`ResultsSink`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod config;
pub mod server;

pub use actor::{
    BroadcastSink, Published, ReceiverError, ReceiverHandle, ResultsReceiver, ResultsSink,
};
pub use config::ReceiverConfig;
pub use server::{RpcServer, ServerConfig};
