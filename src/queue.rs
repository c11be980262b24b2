//! Bounded FIFO job queue moving chunks from waiting to active to completed.
//!
//! One mutex guards all three collections and is held only while they are
//! manipulated. Each job carries its own small lock for its progress fields,
//! always taken after the queue lock when both are needed.

use crate::error::QueueError;
use crate::types::{Chunk, JobState, Status};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::debug;

#[derive(Debug)]
struct Progress {
    state: JobState,
    attempts: u32,
    started_at: Option<SystemTime>,
    completed_at: Option<SystemTime>,
}

/// A chunk plus the state the queue tracks for it.
#[derive(Debug)]
pub struct Job {
    chunk: Chunk,
    progress: Mutex<Progress>,
}

impl Job {
    fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            progress: Mutex::new(Progress {
                state: JobState::Waiting,
                attempts: 0,
                started_at: None,
                completed_at: None,
            }),
        }
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.chunk.id
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn state(&self) -> JobState {
        self.progress().state
    }

    pub fn attempts(&self) -> u32 {
        self.progress().attempts
    }

    /// Snapshot of the job.
    pub fn status(&self) -> Status {
        let progress = self.progress();
        Status {
            chunk: self.chunk.clone(),
            state: progress.state,
            attempts: progress.attempts,
            started_at: progress.started_at,
            completed_at: progress.completed_at,
        }
    }

    fn set_state(&self, state: JobState) {
        self.progress().state = state;
    }

    /// Marks a claimable job `InProgress`. Returns `false` if it was not
    /// claimable.
    fn try_claim(&self) -> bool {
        let mut progress = self.progress();
        if !progress.state.is_claimable() {
            return false;
        }
        progress.state = JobState::InProgress;
        progress.started_at = Some(SystemTime::now());
        true
    }

    /// Counts a new attempt and returns the total so far.
    pub(crate) fn begin_attempt(&self) -> u32 {
        let mut progress = self.progress();
        progress.attempts += 1;
        progress.attempts
    }

    /// Returns a failed job to the pool of claimable work.
    pub(crate) fn requeue(&self) {
        self.set_state(JobState::Waiting);
    }

    /// Moves the job into a terminal state.
    pub(crate) fn finish(&self, state: JobState) {
        debug_assert!(state.is_terminal());
        let mut progress = self.progress();
        progress.state = state;
        progress.completed_at = Some(SystemTime::now());
    }
}

#[derive(Debug, Default)]
struct Inner {
    waiting: VecDeque<Arc<Job>>,
    active: Vec<Arc<Job>>,
    completed: Vec<Arc<Job>>,
    ids: HashSet<String>,
}

impl Inner {
    fn activate_oldest(&mut self, max_active: usize) -> Result<usize, QueueError> {
        if self.active.len() >= max_active {
            return Err(QueueError::MaxActiveJobs);
        }
        let job = self.waiting.pop_front().ok_or(QueueError::NoWaitingJobs)?;
        job.set_state(JobState::Active);
        debug!(chunk = %job.id(), "activated job");
        self.active.push(job);
        Ok(self.waiting.len())
    }
}

/// Thread-safe staging area for upload jobs.
///
/// Jobs are promoted from `waiting` to `active` in FIFO order and never more
/// than `max_active` are active at once. An *open* queue promotes a waiting
/// job whenever a job is added or completed.
///
/// # Example
///
/// ```
/// use glaciersync::{Chunk, JobQueue};
///
/// let queue = JobQueue::new(2, true);
/// for start in [0, 10, 20] {
///     queue.add(Chunk::new("file", start, start + 10)).unwrap();
/// }
/// assert_eq!(queue.active_len(), 2);
/// assert_eq!(queue.waiting_len(), 1);
/// ```
#[derive(Debug)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    max_active: usize,
    open: bool,
}

impl JobQueue {
    pub fn new(max_active: usize, open: bool) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_active,
            open,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Wraps `chunk` in a waiting job at the tail of the queue.
    ///
    /// On an open queue one promotion is attempted afterwards; a full active
    /// set is not an error here. Returns the number of waiting jobs.
    pub fn add(&self, chunk: Chunk) -> Result<usize, QueueError> {
        if chunk.id.is_empty() {
            return Err(QueueError::InvalidChunk("missing chunk ID".to_string()));
        }
        if chunk.is_empty() {
            return Err(QueueError::InvalidChunk(format!(
                "chunk '{}' covers no bytes",
                chunk.id
            )));
        }

        let mut inner = self.lock();
        if !inner.ids.insert(chunk.id.clone()) {
            return Err(QueueError::DuplicateChunk(chunk.id));
        }
        inner.waiting.push_back(Arc::new(Job::new(chunk)));

        if self.open {
            // Capacity signals are expected here.
            let _ = inner.activate_oldest(self.max_active);
        }
        Ok(inner.waiting.len())
    }

    /// Moves the oldest waiting job to the tail of the active set and returns
    /// the number of jobs still waiting.
    pub fn activate_oldest_waiting_job(&self) -> Result<usize, QueueError> {
        self.lock().activate_oldest(self.max_active)
    }

    /// Claims the first active job that is neither in progress nor finished.
    ///
    /// The returned job is already `InProgress`; concurrent callers never
    /// receive the same job.
    pub fn next(&self) -> Result<Arc<Job>, QueueError> {
        let inner = self.lock();
        if inner.active.is_empty() {
            return Err(QueueError::NoActiveJobs);
        }
        inner
            .active
            .iter()
            .find(|job| job.try_claim())
            .cloned()
            .ok_or(QueueError::AllActiveJobsInProgress)
    }

    /// Moves a finished job from the active set to the completed set and
    /// returns the number of completed jobs.
    ///
    /// On an open queue one promotion is attempted afterwards.
    pub fn complete(&self, job: &Job) -> Result<usize, QueueError> {
        if !job.state().is_terminal() {
            return Err(QueueError::JobNotFinished(job.id().to_string()));
        }

        let mut inner = self.lock();
        let index = inner
            .active
            .iter()
            .position(|active| active.id() == job.id())
            .ok_or_else(|| QueueError::JobNotActive(job.id().to_string()))?;
        let finished = inner.active.remove(index);
        inner.completed.push(finished);
        let completed = inner.completed.len();

        if self.open {
            let _ = inner.activate_oldest(self.max_active);
        }
        Ok(completed)
    }

    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn active_len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn completed_len(&self) -> usize {
        self.lock().completed.len()
    }

    /// Whether every job added so far has completed.
    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.waiting.is_empty() && inner.active.is_empty()
    }

    /// Snapshots of completed jobs in completion order.
    pub fn completed_statuses(&self) -> Vec<Status> {
        self.lock().completed.iter().map(|job| job.status()).collect()
    }
}
