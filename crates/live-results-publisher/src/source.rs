//! Polling results-file source.
//!
//! The watched file is a JSON rendering of the results page:
//!
//! ```json
//! {
//!   "Title": "Sprint Champs",
//!   "Courses": [
//!     {
//!       "Title": "Men Elite",
//!       "Info": "2.9km 85m",
//!       "Competitors": [
//!         { "Name": "Mike Edwards", "Club": "RUNANDFALLOVER", "AgeClass": "M21", "Time": "15:50" }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Times are `H:MM:SS`, `MM:SS` or plain seconds. A competitor with an
//! unreadable time, or with `"Valid": false`, is treated as having no valid
//! result. Within each course valid results are ordered by time and invalid
//! ones follow.

use live_results_core::{Competitor, Course, Results, Snapshot};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultsFile {
    #[serde(default)]
    title: String,
    #[serde(default)]
    courses: Vec<CourseEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CourseEntry {
    #[serde(default)]
    title: String,
    #[serde(default)]
    info: String,
    #[serde(default)]
    competitors: Vec<CompetitorEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CompetitorEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    club: String,
    #[serde(default)]
    age_class: String,
    #[serde(default)]
    time: String,
    #[serde(default = "default_valid")]
    valid: bool,
}

fn default_valid() -> bool {
    true
}

/// Decode the contents of a results file.
///
/// # Errors
///
/// Returns [`SourceError::Decode`] if the bytes are not a results document.
pub fn decode_results(bytes: &[u8]) -> Result<Results, SourceError> {
    let file: ResultsFile =
        serde_json::from_slice(bytes).map_err(|e| SourceError::Decode(e.to_string()))?;

    let courses = file
        .courses
        .into_iter()
        .map(|course| {
            let mut competitors: Vec<Competitor> = course
                .competitors
                .into_iter()
                .map(|entry| {
                    let time = parse_time(&entry.time);
                    Competitor::new(
                        entry.name,
                        entry.club,
                        time.unwrap_or_default(),
                        entry.valid && time.is_some(),
                    )
                    .with_age_class(entry.age_class)
                })
                .collect();
            competitors.sort_by_key(|c| (!c.valid, c.time));
            Course::new(course.title, course.info, competitors)
        })
        .collect();

    Ok(Results::new(file.title, courses))
}

/// Parse `H:MM:SS`, `MM:SS` or `SS`.
fn parse_time(value: &str) -> Option<Duration> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    let numeric = |p: &&str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    if parts.len() > 3 || !parts.iter().all(numeric) {
        return None;
    }

    let mut seconds: u64 = 0;
    for part in parts {
        seconds = seconds.checked_mul(60)?.checked_add(part.parse().ok()?)?;
    }
    Some(Duration::from_secs(seconds))
}

/// An active watch on a results file.
///
/// Dropping the watch stops polling.
pub struct FileWatch {
    path: PathBuf,
    updates: mpsc::Receiver<Snapshot>,
    task: JoinHandle<()>,
}

impl FileWatch {
    /// Start watching `path`.
    ///
    /// The current contents are read on the first poll. After that a change in
    /// modification time or length is picked up once the file has been stable
    /// for one poll interval, so a half-written file is not read.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotFound`] if `path` does not name a regular file.
    pub fn start(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, SourceError> {
        let path = path.into();
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(SourceError::NotFound(path.display().to_string())),
        }

        let (tx, updates) = mpsc::channel(16);
        let task = tokio::spawn(poll_file(path.clone(), poll_interval, tx));
        tracing::info!(path = %path.display(), "Watching results file");

        Ok(Self {
            path,
            updates,
            task,
        })
    }

    /// Watched path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next snapshot. Returns `None` if polling has stopped.
    pub async fn next_snapshot(&mut self) -> Option<Snapshot> {
        self.updates.recv().await
    }
}

impl Drop for FileWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type Fingerprint = (Option<SystemTime>, u64);

async fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    let meta = tokio::fs::metadata(path).await?;
    Ok((meta.modified().ok(), meta.len()))
}

async fn poll_file(path: PathBuf, poll_interval: Duration, tx: mpsc::Sender<Snapshot>) {
    let mut emitted: Option<Fingerprint> = None;
    let mut pending: Option<Fingerprint> = None;

    loop {
        match fingerprint(&path).await {
            Ok(current)
                if emitted.is_none() || (emitted != Some(current) && pending == Some(current)) =>
            {
                emitted = Some(current);
                pending = None;
                if let Some(snapshot) = read_snapshot(&path).await {
                    if tx.send(snapshot).await.is_err() {
                        tracing::debug!(
                            path = %path.display(),
                            "Snapshot receiver dropped, stopping watch"
                        );
                        return;
                    }
                }
            }
            Ok(current) if emitted != Some(current) => pending = Some(current),
            Ok(_) => pending = None,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Failed to stat results file");
            }
        }

        tokio::time::sleep(poll_interval).await;
    }
}

async fn read_snapshot(path: &Path) -> Option<Snapshot> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Failed to read results file");
            return None;
        }
    };

    match decode_results(&bytes) {
        Ok(results) => {
            let snapshot = Snapshot::new(results);
            tracing::info!(
                path = %path.display(),
                hash = snapshot.hash(),
                courses = snapshot.results().courses.len(),
                "Loaded results file"
            );
            Some(snapshot)
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "Skipping undecodable results file"
            );
            None
        }
    }
}

/// Errors from the results file source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// The file to watch does not exist
    #[error("results file not found: {0}")]
    NotFound(String),
    /// The file is not a results document
    #[error("failed to decode results file: {0}")]
    Decode(String),
}
