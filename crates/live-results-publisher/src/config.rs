//! Publisher configuration.

use crate::connection::ConnectionConfig;
use crate::distributor::DistributorConfig;
use anyhow::{bail, Context, Result};
use live_results_proto::handshake::{DEFAULT_RPC_PATH, DEFAULT_SERVICE_NAME};
use live_results_proto::{DialConfig, HandshakeConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Shared secret presented to every results server
    pub secret: String,

    /// Request path of the upgrade handshake
    pub rpc_path: String,

    /// Service name expected in the `101` status line
    pub service_name: String,

    /// Bound on each RPC round trip
    pub rpc_timeout: Duration,

    /// Bound on establishing the TCP connection
    pub dial_timeout: Duration,

    /// Bound on TLS setup plus the upgrade handshake
    pub handshake_timeout: Duration,

    /// Results file to watch at startup
    pub watch_file: Option<PathBuf>,

    /// How often the watched file is checked for changes
    pub poll_interval: Duration,

    /// Results servers to connect at startup
    pub targets: Vec<String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            rpc_path: DEFAULT_RPC_PATH.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            rpc_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            watch_file: None,
            poll_interval: Duration::from_secs(1),
            targets: Vec::new(),
        }
    }
}

impl PublisherConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LIVE_RESULTS_SECRET`: Shared secret (required)
    /// - `LIVE_RESULTS_RPC_PATH`: Handshake request path
    /// - `LIVE_RESULTS_SERVICE_NAME`: Expected service name
    /// - `LIVE_RESULTS_RPC_TIMEOUT_MS`: RPC timeout in milliseconds
    /// - `LIVE_RESULTS_DIAL_TIMEOUT_MS`: Connect timeout in milliseconds
    /// - `LIVE_RESULTS_WATCH_FILE`: Results file to watch at startup
    /// - `LIVE_RESULTS_POLL_INTERVAL_MS`: File poll interval in milliseconds
    /// - `LIVE_RESULTS_TARGETS`: Comma-separated results server addresses
    ///
    /// # Errors
    ///
    /// Returns error if the secret is missing or a numeric variable is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

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

        if let Some(ms) = lookup("LIVE_RESULTS_RPC_TIMEOUT_MS") {
            config.rpc_timeout = parse_millis(&ms).context("Invalid LIVE_RESULTS_RPC_TIMEOUT_MS")?;
        }

        if let Some(ms) = lookup("LIVE_RESULTS_DIAL_TIMEOUT_MS") {
            config.dial_timeout =
                parse_millis(&ms).context("Invalid LIVE_RESULTS_DIAL_TIMEOUT_MS")?;
        }

        if let Some(file) = lookup("LIVE_RESULTS_WATCH_FILE") {
            config.watch_file = Some(PathBuf::from(file));
        }

        if let Some(ms) = lookup("LIVE_RESULTS_POLL_INTERVAL_MS") {
            config.poll_interval =
                parse_millis(&ms).context("Invalid LIVE_RESULTS_POLL_INTERVAL_MS")?;
        }

        if let Some(targets) = lookup("LIVE_RESULTS_TARGETS") {
            config.targets = targets
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        Ok(config)
    }

    /// Handshake parameters derived from this configuration.
    #[must_use]
    pub fn handshake(&self) -> HandshakeConfig {
        let mut handshake = HandshakeConfig::new(self.secret.clone());
        handshake.rpc_path.clone_from(&self.rpc_path);
        handshake.service_name.clone_from(&self.service_name);
        handshake
    }

    /// Distributor parameters derived from this configuration.
    #[must_use]
    pub fn distributor(&self) -> DistributorConfig {
        let mut dial = DialConfig::new(self.handshake());
        dial.connect_timeout = self.dial_timeout;
        dial.handshake_timeout = self.handshake_timeout;

        DistributorConfig {
            connection: ConnectionConfig {
                dial,
                rpc_timeout: self.rpc_timeout,
            },
            poll_interval: self.poll_interval,
            ..DistributorConfig::default()
        }
    }
}

fn parse_millis(value: &str) -> Result<Duration> {
    let ms: u64 = value.trim().parse()?;
    if ms == 0 {
        bail!("must be greater than zero");
    }
    Ok(Duration::from_millis(ms))
}
