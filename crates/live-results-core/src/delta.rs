//! Delta encoding and verified application between snapshots.
//!
//! Course lists and each course's competitor list are aligned with an LCS over
//! identity keys. Positions in a [`SequenceDelta`] come from a single walk over
//! the LCS, the old sequence, and the new sequence:
//! - `removed` holds positions in the old sequence
//! - `added` maps positions in the new sequence to the inserted entity
//!
//! Replaying that walk over the old sequence reconstructs the new one.

use crate::lcs::longest_common_subsequence;
use crate::model::{Competitor, Course, Results, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Removals and insertions that turn one ordered sequence into another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDelta<T> {
    /// Positions in the old sequence that are dropped
    pub removed: BTreeSet<usize>,
    /// Entities inserted, keyed by their position in the new sequence
    pub added: BTreeMap<usize, T>,
}

impl<T> Default for SequenceDelta<T> {
    fn default() -> Self {
        Self {
            removed: BTreeSet::new(),
            added: BTreeMap::new(),
        }
    }
}

impl<T> SequenceDelta<T> {
    /// Check if the delta leaves the sequence unchanged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Changes to the course list.
pub type CoursesDelta = SequenceDelta<Course>;

/// Changes to one course's competitor list.
pub type CompetitorsDelta = SequenceDelta<Competitor>;

/// The difference between two snapshots.
///
/// Only valid against the snapshot whose hash is `base_hash`; applying it must
/// produce a snapshot whose hash is `target_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Hash of the snapshot this delta applies to
    pub base_hash: u64,
    /// Hash the reconstructed snapshot must have
    pub target_hash: u64,
    /// New event title, if it changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Course list changes, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub courses: Option<CoursesDelta>,
    /// Competitor changes keyed by course position in the new course list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competitors: Option<BTreeMap<usize, CompetitorsDelta>>,
}

impl Delta {
    /// Compute the delta that turns `old` into `new`.
    #[must_use]
    pub fn encode(old: &Snapshot, new: &Snapshot) -> Self {
        let (old_results, new_results) = (old.results(), new.results());

        let title = (old_results.title != new_results.title).then(|| new_results.title.clone());

        let courses = align(&old_results.courses, &new_results.courses, Course::identity);

        let mut competitors = BTreeMap::new();
        for &(new_index, old_index) in &courses.common {
            let old_course = &old_results.courses[old_index];
            let new_course = &new_results.courses[new_index];
            let aligned = align(
                &old_course.competitors,
                &new_course.competitors,
                Competitor::identity,
            );
            if !aligned.delta.is_empty() {
                competitors.insert(new_index, aligned.delta);
            }
        }

        let delta = Self {
            base_hash: old.hash(),
            target_hash: new.hash(),
            title,
            courses: (!courses.delta.is_empty()).then_some(courses.delta),
            competitors: (!competitors.is_empty()).then_some(competitors),
        };

        tracing::debug!(
            base_hash = delta.base_hash,
            target_hash = delta.target_hash,
            title_changed = delta.title.is_some(),
            courses_changed = delta.courses.is_some(),
            courses_with_competitor_changes = delta.competitors.as_ref().map_or(0, BTreeMap::len),
            "Encoded delta"
        );
        delta
    }

    /// Check if the delta carries no content changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.courses.is_none() && self.competitors.is_none()
    }

    /// Apply this delta to `old`, producing a verified new snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`DeltaError::StaleBase`] if `old` is not the base this delta was
    /// computed against, [`DeltaError::CourseOutOfRange`] if competitor changes
    /// address a course that does not exist, and
    /// [`DeltaError::IntegrityMismatch`] if the reconstructed snapshot does not
    /// hash to `target_hash`. `old` is never modified.
    pub fn apply_to(&self, old: &Snapshot) -> Result<Snapshot, DeltaError> {
        if self.base_hash != old.hash() {
            return Err(DeltaError::StaleBase {
                expected: self.base_hash,
                actual: old.hash(),
            });
        }

        let base = old.results();
        let title = self.title.clone().unwrap_or_else(|| base.title.clone());
        let mut courses = match &self.courses {
            Some(delta) => replay(&base.courses, delta),
            None => base.courses.clone(),
        };

        if let Some(per_course) = &self.competitors {
            let count = courses.len();
            for (&index, delta) in per_course {
                let course = courses
                    .get_mut(index)
                    .ok_or(DeltaError::CourseOutOfRange { index, count })?;
                course.competitors = replay(&course.competitors, delta);
            }
        }

        let candidate = Snapshot::new(Results { title, courses });
        if candidate.hash() != self.target_hash {
            return Err(DeltaError::IntegrityMismatch {
                expected: self.target_hash,
                actual: candidate.hash(),
            });
        }

        Ok(candidate)
    }
}

struct Alignment<T> {
    delta: SequenceDelta<T>,
    /// Matched `(new_index, old_index)` pairs
    common: Vec<(usize, usize)>,
}

fn align<'a, T, K>(old: &'a [T], new: &'a [T], key: impl Fn(&'a T) -> K) -> Alignment<T>
where
    T: Clone,
    K: PartialEq + Clone,
{
    let old_keys: Vec<K> = old.iter().map(&key).collect();
    let new_keys: Vec<K> = new.iter().map(&key).collect();
    let lcs = longest_common_subsequence(&old_keys, &new_keys);

    let mut delta = SequenceDelta::default();
    let mut common = Vec::with_capacity(lcs.len());
    let (mut cursor_lcs, mut cursor_old, mut cursor_new) = (0, 0, 0);

    while cursor_lcs < lcs.len() || cursor_old < old.len() || cursor_new < new.len() {
        while cursor_lcs < lcs.len()
            && cursor_old < old.len()
            && cursor_new < new.len()
            && lcs[cursor_lcs] == old_keys[cursor_old]
            && lcs[cursor_lcs] == new_keys[cursor_new]
        {
            common.push((cursor_new, cursor_old));
            cursor_lcs += 1;
            cursor_old += 1;
            cursor_new += 1;
        }
        while cursor_old < old.len()
            && (cursor_lcs >= lcs.len() || lcs[cursor_lcs] != old_keys[cursor_old])
        {
            delta.removed.insert(cursor_old);
            cursor_old += 1;
        }
        while cursor_new < new.len()
            && (cursor_lcs >= lcs.len() || lcs[cursor_lcs] != new_keys[cursor_new])
        {
            delta.added.insert(cursor_new, new[cursor_new].clone());
            cursor_new += 1;
        }
    }

    Alignment { delta, common }
}

/// Rebuild a sequence from `old` and a delta produced by [`align`].
fn replay<T: Clone>(old: &[T], delta: &SequenceDelta<T>) -> Vec<T> {
    let mut out = Vec::with_capacity(old.len() + delta.added.len());
    let mut cursor = 0;

    loop {
        if let Some(inserted) = delta.added.get(&out.len()) {
            out.push(inserted.clone());
            continue;
        }
        if cursor >= old.len() {
            break;
        }
        if !delta.removed.contains(&cursor) {
            out.push(old[cursor].clone());
        }
        cursor += 1;
    }

    out
}

/// Errors from applying a delta.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    /// The delta was computed against a different snapshot
    #[error("stale base: delta applies to {expected:016x}, current is {actual:016x}")]
    StaleBase {
        /// Base hash named by the delta
        expected: u64,
        /// Hash of the snapshot it was applied to
        actual: u64,
    },
    /// The reconstructed snapshot does not match the delta's target
    #[error("integrity mismatch: expected {expected:016x}, reconstructed {actual:016x}")]
    IntegrityMismatch {
        /// Target hash named by the delta
        expected: u64,
        /// Hash of the reconstructed snapshot
        actual: u64,
    },
    /// Competitor changes address a course position that does not exist
    #[error("competitor delta for course {index}, but only {count} courses")]
    CourseOutOfRange {
        /// Course position named by the delta
        index: usize,
        /// Number of courses after applying course changes
        count: usize,
    },
}
