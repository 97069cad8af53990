//! Results data model and content hashing.
//!
//! Courses and competitors are kept in display order exactly as the producer
//! emitted them. Nothing in this crate reorders them.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use xxhash_rust::xxh3::Xxh3;

/// A single runner's result within a course.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Competitor {
    /// Competitor name
    pub name: String,
    /// Club affiliation
    pub club: String,
    /// Age class (e.g. "M21")
    pub age_class: String,
    /// Elapsed time
    pub time: Duration,
    /// Whether the competitor finished with a valid timed result
    pub valid: bool,
}

impl Competitor {
    /// Create a competitor with no age class.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        club: impl Into<String>,
        time: Duration,
        valid: bool,
    ) -> Self {
        Self {
            name: name.into(),
            club: club.into(),
            age_class: String::new(),
            time,
            valid,
        }
    }

    /// Set the age class.
    #[must_use]
    pub fn with_age_class(mut self, age_class: impl Into<String>) -> Self {
        self.age_class = age_class.into();
        self
    }

    /// Identity used to align competitor lists when diffing.
    pub(crate) fn identity(&self) -> (&str, &str, &str, Duration, bool) {
        (
            &self.name,
            &self.club,
            &self.age_class,
            self.time,
            self.valid,
        )
    }
}

/// A course and its ordered results.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Course {
    /// Course title (e.g. "Men Elite")
    pub title: String,
    /// Free-text course information (length, climb, controls)
    pub info: String,
    /// Competitors in display order
    pub competitors: Vec<Competitor>,
}

impl Course {
    /// Create a course.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        info: impl Into<String>,
        competitors: Vec<Competitor>,
    ) -> Self {
        Self {
            title: title.into(),
            info: info.into(),
            competitors,
        }
    }

    /// Identity used to align course lists when diffing.
    pub(crate) fn identity(&self) -> (&str, &str) {
        (&self.title, &self.info)
    }
}

/// A complete set of results for an event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Results {
    /// Event title
    pub title: String,
    /// Courses in display order
    pub courses: Vec<Course>,
}

impl Results {
    /// Create a results set.
    #[must_use]
    pub fn new(title: impl Into<String>, courses: Vec<Course>) -> Self {
        Self {
            title: title.into(),
            courses,
        }
    }
}

/// Results paired with their content hash.
///
/// The hash identifies the snapshot on the wire: a delta names the hash it
/// applies to and the hash it must produce. A decoded snapshot always carries
/// the hash of its own content; any hash sent alongside is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SnapshotWire")]
pub struct Snapshot {
    results: Results,
    hash: u64,
}

#[derive(Deserialize)]
struct SnapshotWire {
    results: Results,
}

impl From<SnapshotWire> for Snapshot {
    fn from(wire: SnapshotWire) -> Self {
        Self::new(wire.results)
    }
}

impl Snapshot {
    /// Build a snapshot, computing its content hash.
    #[must_use]
    pub fn new(results: Results) -> Self {
        let hash = content_hash(&results);
        Self { results, hash }
    }

    /// The results carried by this snapshot.
    #[must_use]
    pub fn results(&self) -> &Results {
        &self.results
    }

    /// The content hash.
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Consume the snapshot, returning its results.
    #[must_use]
    pub fn into_results(self) -> Results {
        self.results
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new(Results::default())
    }
}

impl From<Results> for Snapshot {
    fn from(results: Results) -> Self {
        Self::new(results)
    }
}

/// Compute the 64-bit content hash of a results set.
///
/// Every string is length-prefixed and every list is count-prefixed, so two
/// results hash equally exactly when their contents are equal field by field.
#[must_use]
pub fn content_hash(results: &Results) -> u64 {
    let mut hasher = Xxh3::new();

    write_str(&mut hasher, &results.title);
    write_len(&mut hasher, results.courses.len());
    for course in &results.courses {
        write_str(&mut hasher, &course.title);
        write_str(&mut hasher, &course.info);
        write_len(&mut hasher, course.competitors.len());
        for competitor in &course.competitors {
            write_str(&mut hasher, &competitor.name);
            write_str(&mut hasher, &competitor.club);
            write_str(&mut hasher, &competitor.age_class);
            hasher.update(&competitor.time.as_secs().to_be_bytes());
            hasher.update(&competitor.time.subsec_nanos().to_be_bytes());
            hasher.update(&[u8::from(competitor.valid)]);
        }
    }

    hasher.digest()
}

fn write_len(hasher: &mut Xxh3, len: usize) {
    hasher.update(&(len as u64).to_be_bytes());
}

fn write_str(hasher: &mut Xxh3, value: &str) {
    write_len(hasher, value.len());
    hasher.update(value.as_bytes());
}
