//! # Live Results Core
//!
//! Results model, content hashing, and the delta codec used to keep remote
//! results servers in sync with a single authoritative source.
//!
//! This crate provides:
//! - The results data model (`Competitor`, `Course`, `Results`) and `Snapshot`,
//!   which pairs results with a deterministic 64-bit content hash
//! - An ordered-sequence longest common subsequence with a prefix/suffix fast path
//! - Delta encoding and verified application between two snapshots

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delta;
pub mod lcs;
pub mod model;

pub use delta::{CompetitorsDelta, CoursesDelta, Delta, DeltaError, SequenceDelta};
pub use model::{content_hash, Competitor, Course, Results, Snapshot};
