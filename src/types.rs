//! Data structures shared by the upload pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Default size of upload parts (1 MiB).
pub const DEFAULT_PART_SIZE: u64 = 1 << 20;

/// Default number of attempts a part gets before it is marked [`JobState::Erred`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Largest part size an archival store accepts (4 GiB).
pub const MAX_PART_SIZE: u64 = 1 << 32;

/// A contiguous `[start, end)` byte range of one file, uploaded as one part.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// Stable identity of the chunk, derived from its path and range.
    pub id: String,
    /// File the range belongs to.
    pub path: PathBuf,
    /// First byte of the range.
    pub start: u64,
    /// One past the last byte of the range.
    pub end: u64,
}

impl Chunk {
    /// Creates a chunk for `[start, end)` of `path` with an id of the form
    /// `<path>#<start>-<end>`.
    pub fn new(path: impl Into<PathBuf>, start: u64, end: u64) -> Self {
        let path = path.into();
        let id = format!("{}#{}-{}", path.display(), start, end);
        Self {
            id,
            path,
            start,
            end,
        }
    }

    /// Number of bytes covered by the chunk.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Converts a part size given in MiB to bytes.
pub fn part_size_from_mib(mib: u64) -> Result<u64, String> {
    mib.checked_mul(1 << 20)
        .ok_or_else(|| format!("part size of {} MiB is too large", mib))
}

/// Lifecycle state of a job.
///
/// Reachable trajectories are `Waiting -> Active -> InProgress -> Completed`
/// and `... -> InProgress -> Waiting -> ... -> Erred`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, or returned to the active set after a failed attempt.
    Waiting,
    /// Promoted into the active set, not yet claimed.
    Active,
    /// Claimed by a worker.
    InProgress,
    /// Uploaded successfully.
    Completed,
    /// Exhausted its attempts.
    Erred,
}

impl JobState {
    /// Whether a worker may claim a job in this state.
    pub fn is_claimable(self) -> bool {
        matches!(self, JobState::Waiting | JobState::Active)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Erred)
    }
}

/// Snapshot of a job, emitted on every transition a worker reports.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub chunk: Chunk,
    pub state: JobState,
    pub attempts: u32,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
}

/// Configuration for uploading files.
///
/// # Example
///
/// ```
/// use glaciersync::UploadConfig;
///
/// let config = UploadConfig {
///     part_size: 8 << 20,
///     max_active: 8,
///     ..UploadConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Size of every part except possibly the last (default: 1 MiB).
    ///
    /// Must be a power-of-two multiple of 1 MiB, at most 4 GiB.
    pub part_size: u64,
    /// Maximum number of parts uploading at once (default: 4).
    pub max_active: usize,
    /// Attempts per part before it is given up on (default: 4).
    pub max_attempts: u32,
    /// Whether additions and completions promote waiting jobs automatically
    /// (default: true).
    pub open: bool,
    /// Number of statuses that may sit unconsumed before workers block
    /// (default: 1).
    pub status_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            max_active: 4,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            open: true,
            status_capacity: 1,
        }
    }
}

impl UploadConfig {
    /// Checks the configuration, returning a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        let mib = self.part_size / DEFAULT_PART_SIZE;
        if self.part_size % DEFAULT_PART_SIZE != 0
            || !mib.is_power_of_two()
            || self.part_size > MAX_PART_SIZE
        {
            return Err(format!(
                "part size {} must be a power-of-two number of MiB between 1 MiB and 4 GiB",
                self.part_size
            ));
        }
        if self.max_active == 0 {
            return Err("max_active must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.status_capacity == 0 {
            return Err("status_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}
