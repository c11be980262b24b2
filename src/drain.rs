//! Worker loop that drains a [`JobQueue`] with bounded retries.

use crate::error::QueueError;
use crate::queue::{Job, JobQueue};
use crate::types::{Chunk, JobState, Status};
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// The action performed against each chunk, typically uploading its bytes.
pub trait UploadAction: Send + Sync + 'static {
    fn upload(&self, chunk: Chunk) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> UploadAction for F
where
    F: Fn(Chunk) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn upload(&self, chunk: Chunk) -> BoxFuture<'static, anyhow::Result<()>> {
        (self)(chunk).boxed()
    }
}

/// Receiving ends of the streams every [`Drain`] worker reports into.
///
/// Both must be drained for as long as workers run: a full status channel
/// blocks the workers that emit into it.
#[derive(Debug)]
pub struct DrainStreams {
    /// Every job transition a worker reports.
    pub statuses: mpsc::Receiver<Status>,
    /// Structural queue failures that stopped a worker.
    pub errors: mpsc::Receiver<QueueError>,
}

/// Runs jobs from a queue until nothing is left to claim.
///
/// Cloning a `Drain` shares its action and streams; each clone can run as an
/// independent worker. The streams close once every clone is dropped.
#[derive(Clone)]
pub struct Drain {
    action: Arc<dyn UploadAction>,
    max_attempts: u32,
    statuses: mpsc::Sender<Status>,
    errors: mpsc::Sender<QueueError>,
}

impl Drain {
    /// Creates a drain around `action`.
    ///
    /// # Arguments
    ///
    /// * `action` - Performed once per attempt on a claimed chunk
    /// * `max_attempts` - Attempts before a job is marked `Erred`
    /// * `capacity` - Statuses that may queue up before workers block
    pub fn new<A: UploadAction>(
        action: A,
        max_attempts: u32,
        capacity: usize,
    ) -> (Self, DrainStreams) {
        let (status_tx, status_rx) = mpsc::channel(capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(capacity.max(1));
        let drain = Self {
            action: Arc::new(action),
            max_attempts: max_attempts.max(1),
            statuses: status_tx,
            errors: error_tx,
        };
        let streams = DrainStreams {
            statuses: status_rx,
            errors: error_rx,
        };
        (drain, streams)
    }

    /// Starts `workers` concurrent workers against `queue`.
    pub fn spawn(&self, queue: &Arc<JobQueue>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|_| {
                let drain = self.clone();
                let queue = Arc::clone(queue);
                tokio::spawn(async move { drain.run(&queue).await })
            })
            .collect()
    }

    /// Claims and runs jobs until the queue has nothing claimable.
    ///
    /// A failed attempt returns the job to `Waiting` until it has used
    /// `max_attempts`, after which it is `Erred`. Both terminal states are
    /// reported and moved out of the active set.
    pub async fn run(&self, queue: &JobQueue) {
        loop {
            let job = match queue.next() {
                Ok(job) => job,
                Err(err) if err.is_expected() => return,
                Err(err) => {
                    self.report(err).await;
                    return;
                }
            };

            self.emit(&job).await;

            let attempt = job.begin_attempt();
            match self.action.upload(job.chunk().clone()).await {
                Ok(()) => job.finish(JobState::Completed),
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        "attempt #{} for {} failed, retrying | {:#}",
                        attempt,
                        job.id(),
                        e
                    );
                    job.requeue();
                    continue;
                }
                Err(e) => {
                    error!("{} failed after {} attempts | {:#}", job.id(), attempt, e);
                    job.finish(JobState::Erred);
                }
            }

            self.emit(&job).await;

            if let Err(err) = queue.complete(&job) {
                self.report(err).await;
                return;
            }
        }
    }

    async fn emit(&self, job: &Job) {
        if self.statuses.send(job.status()).await.is_err() {
            debug!(chunk = %job.id(), "status receiver dropped");
        }
    }

    async fn report(&self, err: QueueError) {
        error!("worker stopped: {}", err);
        let _ = self.errors.send(err).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    fn collect_statuses(mut streams: DrainStreams) -> JoinHandle<Vec<Status>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(status) = streams.statuses.recv().await {
                seen.push(status);
            }
            seen
        })
    }

    /// An action that fails the first `failures` calls and then succeeds.
    fn flaky(failures: u32) -> impl UploadAction {
        let calls = Arc::new(AtomicU32::new(0));
        move |_chunk: Chunk| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    anyhow::bail!("transient failure");
                }
                Ok(())
            }
        }
    }

    fn single_job_queue() -> Arc<JobQueue> {
        let queue = Arc::new(JobQueue::new(1, true));
        queue.add(Chunk::new("file", 0, 10)).unwrap();
        queue
    }

    async fn drain_one(failures: u32) -> (Arc<JobQueue>, Vec<Status>) {
        let queue = single_job_queue();
        let (drain, streams) = Drain::new(flaky(failures), 4, 1);
        let collector = collect_statuses(streams);
        drain.run(&queue).await;
        drop(drain);
        (queue, collector.await.unwrap())
    }

    fn states(statuses: &[Status]) -> Vec<JobState> {
        statuses.iter().map(|s| s.state).collect()
    }

    #[tokio::test]
    async fn test_retries_then_completes() {
        let (queue, statuses) = drain_one(2).await;

        assert_eq!(
            states(&statuses),
            vec![
                JobState::InProgress,
                JobState::InProgress,
                JobState::InProgress,
                JobState::Completed
            ]
        );
        let last = statuses.last().unwrap();
        assert_eq!(last.attempts, 3);
        assert!(last.completed_at.is_some());
        assert!(queue.is_idle());
        assert_eq!(queue.completed_len(), 1);
    }

    #[tokio::test]
    async fn test_succeeds_on_last_attempt() {
        let (queue, statuses) = drain_one(3).await;
        let last = statuses.last().unwrap();
        assert_eq!(last.state, JobState::Completed);
        assert_eq!(last.attempts, 4);
        assert_eq!(queue.completed_statuses()[0].state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_end_erred() {
        let (queue, statuses) = drain_one(u32::MAX).await;

        assert_eq!(statuses.len(), 5);
        let last = statuses.last().unwrap();
        assert_eq!(last.state, JobState::Erred);
        assert_eq!(last.attempts, 4);
        assert!(queue.is_idle());
        assert_eq!(queue.completed_statuses()[0].state, JobState::Erred);
    }

    #[tokio::test]
    async fn test_empty_queue_stops_quietly() {
        let queue = Arc::new(JobQueue::new(2, true));
        let (drain, mut streams) = Drain::new(flaky(0), 4, 1);
        drain.run(&queue).await;
        drop(drain);
        assert!(streams.statuses.recv().await.is_none());
        assert!(streams.errors.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_respects_concurrency_cap() {
        const MAX_ACTIVE: usize = 3;
        let queue = Arc::new(JobQueue::new(MAX_ACTIVE, true));
        for i in 0..20u64 {
            queue.add(Chunk::new("file", i * 10, (i + 1) * 10)).unwrap();
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let action = {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |_chunk: Chunk| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };

        let (drain, streams) = Drain::new(action, 4, 1);
        let collector = collect_statuses(streams);
        for handle in drain.spawn(&queue, MAX_ACTIVE) {
            handle.await.unwrap();
        }
        drop(drain);
        let statuses = collector.await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= MAX_ACTIVE);
        assert!(queue.is_idle());
        assert_eq!(queue.completed_len(), 20);
        let completed = statuses
            .iter()
            .filter(|s| s.state == JobState::Completed)
            .count();
        assert_eq!(completed, 20);
    }
}
