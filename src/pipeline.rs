//! Main orchestration logic for uploading files.

use crate::buffer::ChunkBuffer;
use crate::chunker::{chunk_file, collect_file_paths, FileSizer, OsFileSizer};
use crate::drain::{Drain, DrainStreams};
use crate::error::{QueueError, UploadError};
use crate::queue::JobQueue;
use crate::store::{ArchiveStore, Part};
use crate::types::{Chunk, JobState, Status, UploadConfig};
use futures_util::future::{join_all, BoxFuture, FutureExt};
use indicatif::ProgressBar;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Outcome of a successful archive upload.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReceipt {
    /// Local file that was uploaded.
    pub path: PathBuf,
    /// Id the store assigned to the multipart upload.
    pub upload_id: String,
    /// Id of the stored archive.
    pub archive_id: String,
    /// Archive size in bytes.
    pub size: u64,
    /// Number of parts uploaded.
    pub parts: usize,
    /// Hex-encoded tree hash of the archive.
    pub tree_hash: String,
    /// Wall time spent on the upload.
    pub elapsed: Duration,
}

fn join_error(e: tokio::task::JoinError) -> UploadError {
    UploadError::Io(std::io::Error::other(format!("Task join error: {}", e)))
}

/// Uploads files to an [`ArchiveStore`] as concurrently uploaded parts.
///
/// # Example
///
/// ```no_run
/// use glaciersync::{DryRunStore, UploadConfig, Uploader};
/// use std::path::Path;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let uploader = Uploader::new(UploadConfig::default(), Arc::new(DryRunStore::new()));
/// let pb = indicatif::ProgressBar::hidden();
/// let receipt = uploader.upload_file(Path::new("backup.tar"), &pb).await?;
/// println!("{}", receipt.tree_hash);
/// # Ok(())
/// # }
/// ```
pub struct Uploader<S: ArchiveStore> {
    config: UploadConfig,
    store: Arc<S>,
    hashes: Arc<ChunkBuffer>,
    /// Upload ids of files initiated but not completed.
    upload_ids: Mutex<HashMap<PathBuf, String>>,
    /// Paths with an `upload_file` call running. Hashes are keyed by path, so
    /// a path is uploaded by at most one call at a time.
    in_flight: Mutex<HashSet<PathBuf>>,
}

/// Marks a path as being uploaded until dropped.
struct InFlight<'a> {
    paths: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.paths
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.path);
    }
}

impl<S: ArchiveStore> Uploader<S> {
    pub fn new(config: UploadConfig, store: Arc<S>) -> Self {
        Self {
            config,
            store,
            hashes: Arc::new(ChunkBuffer::new()),
            upload_ids: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    fn upload_ids(&self) -> MutexGuard<'_, HashMap<PathBuf, String>> {
        self.upload_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, path: &Path) -> Result<InFlight<'_>, UploadError> {
        let mut paths = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !paths.insert(path.to_path_buf()) {
            return Err(UploadError::AlreadyUploading(path.to_path_buf()));
        }
        Ok(InFlight {
            paths: &self.in_flight,
            path: path.to_path_buf(),
        })
    }

    /// The upload id of a file whose upload was initiated but not completed,
    /// e.g. because some of its parts failed. Callers may use it to abort the
    /// upload with the store.
    pub fn pending_upload(&self, path: &Path) -> Option<String> {
        self.upload_ids().get(path).cloned()
    }

    /// Uploads every file at or beneath `target`, one file at a time.
    ///
    /// Stops at the first file that fails.
    pub async fn upload_target(
        &self,
        target: &Path,
        pb: &ProgressBar,
    ) -> Result<Vec<ArchiveReceipt>, UploadError> {
        let files = collect_file_paths(target)?;
        if files.is_empty() {
            return Err(UploadError::NoFiles(target.to_path_buf()));
        }
        info!("Found {} file(s) under {}", files.len(), target.display());

        let mut receipts = Vec::with_capacity(files.len());
        for path in files {
            receipts.push(self.upload_file(&path, pb).await?);
        }
        Ok(receipts)
    }

    /// Uploads one file in parts and completes it with its tree hash.
    ///
    /// This performs the following steps:
    /// 1. Splits the file into parts of `part_size` bytes
    /// 2. Initiates the upload with the store
    /// 3. Queues every part and runs `max_active` workers over the queue,
    ///    each reading, hashing and uploading one part at a time
    /// 4. Reassembles the tree hash from the part hashes and completes the
    ///    upload
    ///
    /// # Arguments
    ///
    /// * `path` - File to upload
    /// * `pb` - Progress bar advanced by the bytes of each uploaded part
    ///
    /// # Returns
    ///
    /// The receipt of the stored archive, or an error. Parts that exhaust
    /// their attempts fail the upload with [`UploadError::PartsFailed`]. A
    /// path already being uploaded through this uploader is rejected with
    /// [`UploadError::AlreadyUploading`].
    pub async fn upload_file(
        &self,
        path: &Path,
        pb: &ProgressBar,
    ) -> Result<ArchiveReceipt, UploadError> {
        self.config.validate().map_err(UploadError::InvalidConfig)?;
        let _claim = self.claim(path)?;
        let started = Instant::now();

        let size = OsFileSizer.file_size(path)?;
        if size == 0 {
            return Err(UploadError::EmptyFile(path.to_path_buf()));
        }
        let chunks = chunk_file(&OsFileSizer, path, self.config.part_size)?;
        let total_parts = chunks.len();
        info!(
            "⬆️  Uploading {} ({} bytes in {} part(s))",
            path.display(),
            size,
            total_parts
        );

        let upload_id = self.store.initiate(path, self.config.part_size).await?;
        self.upload_ids().insert(path.to_path_buf(), upload_id.clone());

        pb.set_length(size);
        pb.set_position(0);
        pb.set_message(format!("{}", path.display()));

        let queue = Arc::new(JobQueue::new(self.config.max_active, self.config.open));
        for chunk in chunks {
            queue.add(chunk)?;
        }

        let file = Arc::new(std::fs::File::open(path)?);
        let action = self.part_action(file, upload_id.clone());
        let (drain, streams) = Drain::new(
            action,
            self.config.max_attempts,
            self.config.status_capacity,
        );
        let DrainStreams { statuses, errors } = streams;
        let status_task = tokio::spawn(track_statuses(statuses, pb.clone()));
        let error_task = tokio::spawn(collect_errors(errors));

        self.run_workers(&drain, &queue).await;
        drop(drain);

        let seen = status_task.await.map_err(join_error)?;
        let queue_errors = error_task.await.map_err(join_error)?;
        debug!("Observed {} status updates for {}", seen, path.display());

        if let Some(err) = queue_errors.into_iter().next() {
            self.hashes.discard(path);
            return Err(err.into());
        }

        let erred = queue
            .completed_statuses()
            .iter()
            .filter(|status| status.state == JobState::Erred)
            .count();
        let failed = erred + (total_parts - queue.completed_len());
        if failed > 0 {
            self.hashes.discard(path);
            pb.set_message(format!("❌ {} failed", path.display()));
            return Err(UploadError::PartsFailed {
                path: path.to_path_buf(),
                failed,
                total: total_parts,
            });
        }

        let tree_hash = hex::encode(self.hashes.tree_hash(&OsFileSizer, path)?);
        self.hashes.discard(path);
        let archive_id = self.store.complete(&upload_id, size, &tree_hash).await?;
        self.upload_ids().remove(path);

        pb.set_message(format!("✅ {}", path.display()));
        info!(
            "✅ Uploaded {} as archive {} (tree hash {})",
            path.display(),
            archive_id,
            tree_hash
        );

        Ok(ArchiveReceipt {
            path: path.to_path_buf(),
            upload_id,
            archive_id,
            size,
            parts: total_parts,
            tree_hash,
            elapsed: started.elapsed(),
        })
    }

    /// Builds the per-attempt action: read and hash the part on a blocking
    /// thread, then hand it to the store.
    fn part_action(
        &self,
        file: Arc<std::fs::File>,
        upload_id: String,
    ) -> impl Fn(Chunk) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
        let hashes = Arc::clone(&self.hashes);
        let store = Arc::clone(&self.store);
        let upload_id = Arc::new(upload_id);

        move |chunk: Chunk| {
            let hashes = Arc::clone(&hashes);
            let store = Arc::clone(&store);
            let file = Arc::clone(&file);
            let upload_id = Arc::clone(&upload_id);

            async move {
                let range = chunk.clone();
                let fetched = tokio::task::spawn_blocking(move || {
                    hashes.fetch_and_hash(&*file, range.path(), range.start, range.end)
                })
                .await??;

                let part = Part {
                    chunk,
                    bytes: fetched.bytes,
                    sha256: fetched.sha256,
                };
                store.upload_part(&upload_id, part).await
            }
            .boxed()
        }
    }

    /// Runs rounds of workers until the queue is drained or stops making
    /// progress. A closed queue is topped up between rounds.
    async fn run_workers(&self, drain: &Drain, queue: &Arc<JobQueue>) {
        loop {
            if !queue.is_open() {
                loop {
                    match queue.activate_oldest_waiting_job() {
                        Ok(_) => continue,
                        Err(QueueError::MaxActiveJobs | QueueError::NoWaitingJobs) => break,
                        Err(err) => {
                            warn!("Failed to activate job: {}", err);
                            break;
                        }
                    }
                }
            }

            let completed_before = queue.completed_len();
            for result in join_all(drain.spawn(queue, self.config.max_active)).await {
                if let Err(e) = result {
                    error!("Worker task failed: {}", e);
                }
            }

            if queue.is_idle() || queue.waiting_len() == 0 {
                return;
            }
            if queue.completed_len() == completed_before {
                warn!(
                    "Upload stalled with {} part(s) waiting and {} active",
                    queue.waiting_len(),
                    queue.active_len()
                );
                return;
            }
        }
    }
}

/// Consumes the status stream, advancing `pb` as parts complete. Returns the
/// number of statuses seen.
async fn track_statuses(mut statuses: mpsc::Receiver<Status>, pb: ProgressBar) -> usize {
    let mut seen = 0;
    while let Some(status) = statuses.recv().await {
        seen += 1;
        match status.state {
            JobState::Completed => pb.inc(status.chunk.len()),
            JobState::Erred => warn!(
                "❌ Part {} gave up after {} attempts",
                status.chunk.id, status.attempts
            ),
            _ => debug!(
                "{} {:?} (attempt {})",
                status.chunk.id,
                status.state,
                status.attempts + 1
            ),
        }
    }
    seen
}

async fn collect_errors(mut errors: mpsc::Receiver<QueueError>) -> Vec<QueueError> {
    let mut collected = Vec::new();
    while let Some(err) = errors.recv().await {
        collected.push(err);
    }
    collected
}
