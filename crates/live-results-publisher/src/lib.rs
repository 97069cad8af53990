//! # Live Results Publisher
//!
//! Watches a results source and keeps any number of remote results servers
//! up to date with it.
//!
//! ## Architecture
//!
//! - **Source**: polls a results file and hands each new [`Snapshot`] to the distributor
//! - **Distributor**: an actor owning the latest snapshot, the watch and the target set
//! - **Connections**: one worker per results server, sending a full snapshot
//!   first and deltas against the last acknowledged snapshot afterwards
//! - **Management**: JSON actions for inspecting and reconfiguring the distributor
//!
//! [`Snapshot`]: live_results_core::Snapshot

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod distributor;
pub mod management;
pub mod source;

pub use config::PublisherConfig;
pub use connection::{ConnectionConfig, SubmitOutcome, TargetConnection, TargetHandle};
pub use distributor::{
    Distributor, DistributorConfig, DistributorError, DistributorHandle, WatchStatus,
};
pub use management::{dispatch, ApiRequest, ApiResponse, ManagementError};
pub use source::{decode_results, FileWatch, SourceError};
