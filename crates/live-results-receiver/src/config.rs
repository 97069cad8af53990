//! Receiver configuration.

use crate::server::ServerConfig;
use anyhow::{bail, Context, Result};
use live_results_proto::handshake::{DEFAULT_RPC_PATH, DEFAULT_SERVICE_NAME};
use live_results_proto::HandshakeConfig;
use std::time::Duration;

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Address to listen on, e.g. `0.0.0.0:8080`
    pub listen: String,

    /// Shared secret publishers must present
    pub secret: String,

    /// Request path of the upgrade handshake
    pub rpc_path: String,

    /// Service name sent in the `101` status line
    pub service_name: String,

    /// Bound on reading and answering the upgrade request
    pub handshake_timeout: Duration,

    /// How far a broadcast subscriber may fall behind
    pub broadcast_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            secret: String::new(),
            rpc_path: DEFAULT_RPC_PATH.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            handshake_timeout: Duration::from_secs(10),
            broadcast_capacity: 64,
        }
    }
}

impl ReceiverConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LIVE_RESULTS_LISTEN`: Listen address (required)
    /// - `LIVE_RESULTS_SECRET`: Shared secret (required)
    /// - `LIVE_RESULTS_RPC_PATH`: Handshake request path
    /// - `LIVE_RESULTS_SERVICE_NAME`: Service name announced to publishers
    /// - `LIVE_RESULTS_HANDSHAKE_TIMEOUT_MS`: Handshake timeout in milliseconds
    ///
    /// # Errors
    ///
    /// Returns error if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        match lookup("LIVE_RESULTS_LISTEN") {
            Some(listen) if !listen.trim().is_empty() => config.listen = listen.trim().to_string(),
            _ => bail!("LIVE_RESULTS_LISTEN must be set"),
        }

        match lookup("LIVE_RESULTS_SECRET") {
            Some(secret) if !secret.is_empty() => config.secret = secret,
            _ => bail!("LIVE_RESULTS_SECRET must be set"),
        }

        if let Some(path) = lookup("LIVE_RESULTS_RPC_PATH") {
            config.rpc_path = path;
        }

        if let Some(name) = lookup("LIVE_RESULTS_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Some(ms) = lookup("LIVE_RESULTS_HANDSHAKE_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .context("Invalid LIVE_RESULTS_HANDSHAKE_TIMEOUT_MS")?;
            config.handshake_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Server parameters derived from this configuration.
    #[must_use]
    pub fn server(&self) -> ServerConfig {
        let mut handshake = HandshakeConfig::new(self.secret.clone());
        handshake.rpc_path.clone_from(&self.rpc_path);
        handshake.service_name.clone_from(&self.service_name);
        ServerConfig {
            handshake,
            handshake_timeout: self.handshake_timeout,
        }
    }
}
