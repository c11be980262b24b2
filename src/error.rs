//! Error types for queue, hashing and upload operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by [`JobQueue`](crate::queue::JobQueue) operations.
///
/// Most variants are control-flow signals rather than failures; see
/// [`QueueError::is_expected`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The chunk has no identity or covers no bytes.
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// A job for this chunk is already held by the queue.
    #[error("chunk '{0}' is already queued")]
    DuplicateChunk(String),

    /// Promotion refused because the active set is full.
    #[error("active jobs are already maxed")]
    MaxActiveJobs,

    /// Promotion refused because nothing is waiting.
    #[error("no jobs are waiting")]
    NoWaitingJobs,

    /// No job is active.
    #[error("no jobs are active")]
    NoActiveJobs,

    /// Every active job has already been claimed by a worker.
    #[error("all active jobs are in progress")]
    AllActiveJobsInProgress,

    /// The job being completed is not in the active set.
    #[error("job with chunk ID '{0}' is not active")]
    JobNotActive(String),

    /// The job being completed has not reached a terminal state.
    #[error("job with chunk ID '{0}' has not finished")]
    JobNotFinished(String),
}

impl QueueError {
    /// Returns `true` for capacity and availability signals that callers
    /// recover from locally.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            QueueError::MaxActiveJobs
                | QueueError::NoWaitingJobs
                | QueueError::NoActiveJobs
                | QueueError::AllActiveJobsInProgress
        )
    }
}

/// Errors raised while fetching chunk bytes or computing tree hashes.
#[derive(Error, Debug)]
pub enum BufferError {
    /// The requested byte range is empty or inverted.
    #[error("invalid byte range [{start}, {end})")]
    InvalidRange { start: u64, end: u64 },

    /// The reader returned fewer bytes than the range requires.
    #[error("incomplete buffer: expected {expected} bytes, read {read}")]
    IncompleteBuffer { expected: usize, read: usize },

    /// The recorded ranges do not yet tile the whole file.
    #[error("missing chunks for {}", .0.display())]
    MissingFileChunks(PathBuf),

    /// I/O error from the reader or the file-size oracle.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors that can occur while uploading a file or target.
#[derive(Error, Debug)]
pub enum UploadError {
    /// I/O error during file operations.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Structural job queue failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Chunk read or tree hash failure.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Failure reported by the archive store.
    #[error(transparent)]
    Store(#[from] anyhow::Error),

    /// The upload configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Another call on the same uploader is already uploading this path.
    #[error("{} is already being uploaded", .0.display())]
    AlreadyUploading(PathBuf),

    /// The file has no bytes to upload.
    #[error("{} is empty", .0.display())]
    EmptyFile(PathBuf),

    /// The target contains no files.
    #[error("invalid target {}: no file(s) found", .0.display())]
    NoFiles(PathBuf),

    /// Some parts exhausted their attempts.
    #[error("{failed} of {total} parts of {} failed to upload", .path.display())]
    PartsFailed {
        path: PathBuf,
        failed: usize,
        total: usize,
    },
}
