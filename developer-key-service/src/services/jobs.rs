//! Background job queue with named lanes.
//!
//! Jobs sharing a [`Strand`] run one at a time in enqueue order on a
//! dedicated tokio task; different strands run concurrently. A lane's task
//! exits once its channel runs dry and the next job for the strand starts a
//! new one. A job failing with [`JobError::Retriable`] is retried with
//! exponential backoff until its attempts run out, holding up the rest of its
//! strand meanwhile. Permanent failures go to the [`ErrorReporter`].

use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

use super::error_reporter::ErrorReporter;

/// Error category used when reporting permanently failed jobs.
pub const JOB_ERROR_CATEGORY: &str = "developer_keys";

/// Serialization lane for jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Strand {
    pub purpose: &'static str,
    pub key: String,
}

impl Strand {
    pub fn new(purpose: &'static str, key: impl Into<String>) -> Self {
        Self {
            purpose,
            key: key.into(),
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.purpose, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueArgs {
    pub strand: Strand,
    pub max_attempts: u32,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("retriable job failure: {0}")]
    Retriable(anyhow::Error),

    #[error("fatal job failure: {0}")]
    Fatal(anyhow::Error),
}

impl JobError {
    pub fn into_inner(self) -> anyhow::Error {
        match self {
            JobError::Retriable(e) | JobError::Fatal(e) => e,
        }
    }
}

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Run the job. `queue` lets a job schedule follow-up work.
    async fn perform(&self, queue: &JobQueue) -> Result<(), JobError>;
}

/// Backoff between attempts of a retried job.
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl JobQueueConfig {
    /// Retry immediately. Used by tests.
    pub fn no_backoff() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Backoff for one job. Attempts are capped by the job, not by time.
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(self.backoff_multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

struct QueuedJob {
    job: Box<dyn Job>,
    args: EnqueueArgs,
    enqueued_at: Instant,
}

struct Lane {
    id: u64,
    sender: mpsc::UnboundedSender<QueuedJob>,
}

struct Inner {
    lanes: DashMap<Strand, Lane>,
    next_lane_id: AtomicU64,
    reporter: Arc<dyn ErrorReporter>,
    config: JobQueueConfig,
    pending: AtomicUsize,
    idle: Notify,
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(reporter: Arc<dyn ErrorReporter>, config: JobQueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                lanes: DashMap::new(),
                next_lane_id: AtomicU64::new(0),
                reporter,
                config,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                enqueued: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retried: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule `job` on its strand. Must be called within a tokio runtime.
    pub fn enqueue<J: Job>(&self, job: J, args: EnqueueArgs) {
        let name = job.name();
        tracing::debug!(job = %name, strand = %args.strand, "Enqueueing job");

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        self.inner.enqueued.fetch_add(1, Ordering::Relaxed);

        let strand = args.strand.clone();
        let mut queued = QueuedJob {
            job: Box::new(job),
            args,
            enqueued_at: Instant::now(),
        };

        // Sends happen under the map entry lock so an idle lane cannot be
        // retired between lookup and send. A lane whose worker is gone gets
        // replaced once.
        for _ in 0..2 {
            let sent = {
                let lane = self
                    .inner
                    .lanes
                    .entry(strand.clone())
                    .or_insert_with(|| self.spawn_lane(&strand));
                lane.sender.send(queued)
            };
            match sent {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    tracing::warn!(strand = %strand, "Job lane closed, restarting");
                    self.inner.lanes.remove(&strand);
                    queued = returned;
                }
            }
        }

        tracing::error!(job = %name, strand = %strand, "Failed to enqueue job");
        self.inner.reporter.capture_exception(
            JOB_ERROR_CATEGORY,
            &anyhow::anyhow!("could not enqueue job {} on strand {}", name, strand),
        );
        self.finish_one();
    }

    /// Wait until every enqueued job, including jobs enqueued by running
    /// jobs, has finished.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Number of strands with a running lane.
    pub fn active_lanes(&self) -> usize {
        self.inner.lanes.len()
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            enqueued: self.inner.enqueued.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            retried: self.inner.retried.load(Ordering::Relaxed),
        }
    }

    fn spawn_lane(&self, strand: &Strand) -> Lane {
        let (sender, mut rx) = mpsc::unbounded_channel::<QueuedJob>();
        let id = self.inner.next_lane_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let strand = strand.clone();

        tokio::spawn(async move {
            tracing::debug!(strand = %strand, lane = id, "Job lane started");
            while let Some(queued) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let queue = JobQueue { inner };
                queue.run(queued).await;

                // Retire the lane before reporting the job done, so an idle
                // queue holds no lanes.
                let retired = queue
                    .inner
                    .lanes
                    .remove_if(&strand, |_, lane| lane.id == id && rx.is_empty())
                    .is_some();
                queue.finish_one();
                if retired {
                    break;
                }
            }
            tracing::debug!(strand = %strand, lane = id, "Job lane stopped");
        });

        Lane { id, sender }
    }

    async fn run(&self, queued: QueuedJob) {
        let QueuedJob {
            job,
            args,
            enqueued_at,
        } = queued;
        let name = job.name();
        let max_attempts = args.max_attempts.max(1);
        let attempts = AtomicU32::new(0);

        let (job, attempts_ref, strand) = (&job, &attempts, &args.strand);
        let result = retry_notify(
            self.inner.config.backoff(),
            move || async move {
                let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
                match job.perform(self).await {
                    Ok(()) => Ok(()),
                    Err(e @ JobError::Retriable(_)) if attempt < max_attempts => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            },
            |e: JobError, delay: Duration| {
                self.inner.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    job = %name,
                    strand = %strand,
                    attempt = attempts_ref.load(Ordering::SeqCst),
                    max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed, retrying after backoff"
                );
            },
        )
        .await;

        let attempt = attempts.load(Ordering::SeqCst);
        match result {
            Ok(()) => {
                self.inner.completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    job = %name,
                    strand = %args.strand,
                    attempt,
                    queued_ms = enqueued_at.elapsed().as_millis() as u64,
                    "Job completed"
                );
            }
            Err(e) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    job = %name,
                    strand = %args.strand,
                    attempt,
                    error = %e,
                    "Job permanently failed"
                );
                let error = e
                    .into_inner()
                    .context(format!("job {} failed after {} attempt(s)", name, attempt));
                self.inner
                    .reporter
                    .capture_exception(JOB_ERROR_CATEGORY, &error);
            }
        }
    }

    fn finish_one(&self) {
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::error_reporter::MockErrorReporter;
    use std::sync::Mutex;
    use tokio::time::sleep;

    struct Record {
        log: Arc<Mutex<Vec<String>>>,
        label: String,
        delay_ms: u64,
    }

    #[async_trait]
    impl Job for Record {
        fn name(&self) -> String {
            format!("record:{}", self.label)
        }

        async fn perform(&self, _queue: &JobQueue) -> Result<(), JobError> {
            sleep(Duration::from_millis(self.delay_ms)).await;
            self.log.lock().unwrap().push(self.label.clone());
            Ok(())
        }
    }

    struct Flaky {
        attempts: Arc<AtomicU64>,
        succeed_on: u64,
        fatal: bool,
    }

    #[async_trait]
    impl Job for Flaky {
        fn name(&self) -> String {
            "flaky".to_string()
        }

        async fn perform(&self, _queue: &JobQueue) -> Result<(), JobError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= self.succeed_on {
                return Ok(());
            }
            if self.fatal {
                Err(JobError::Fatal(anyhow::anyhow!("bad input")))
            } else {
                Err(JobError::Retriable(anyhow::anyhow!("shard unavailable")))
            }
        }
    }

    struct FanOut {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Job for FanOut {
        fn name(&self) -> String {
            "fan_out".to_string()
        }

        async fn perform(&self, queue: &JobQueue) -> Result<(), JobError> {
            for i in 0..3 {
                queue.enqueue(
                    Record {
                        log: self.log.clone(),
                        label: format!("child-{}", i),
                        delay_ms: 0,
                    },
                    args("children", 4),
                );
            }
            Ok(())
        }
    }

    fn args(key: &str, max_attempts: u32) -> EnqueueArgs {
        EnqueueArgs {
            strand: Strand::new("test", key),
            max_attempts,
        }
    }

    fn queue() -> (JobQueue, Arc<MockErrorReporter>) {
        let reporter = Arc::new(MockErrorReporter::new());
        (
            JobQueue::new(reporter.clone(), JobQueueConfig::no_backoff()),
            reporter,
        )
    }

    #[tokio::test]
    async fn test_strand_runs_in_enqueue_order() {
        let (queue, _) = queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (label, delay_ms) in [("first", 30), ("second", 0), ("third", 10)] {
            queue.enqueue(
                Record {
                    log: log.clone(),
                    label: label.to_string(),
                    delay_ms,
                },
                args("lane", 1),
            );
        }

        queue.drain().await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_retriable_job_retries_until_success() {
        let (queue, reporter) = queue();
        let attempts = Arc::new(AtomicU64::new(0));
        queue.enqueue(
            Flaky {
                attempts: attempts.clone(),
                succeed_on: 3,
                fatal: false,
            },
            args("lane", 4),
        );

        queue.drain().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(queue.stats().retried, 2);
        assert_eq!(queue.stats().completed, 1);
        assert!(reporter.captured().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_reported() {
        let (queue, reporter) = queue();
        let attempts = Arc::new(AtomicU64::new(0));
        queue.enqueue(
            Flaky {
                attempts: attempts.clone(),
                succeed_on: u64::MAX,
                fatal: false,
            },
            args("lane", 4),
        );

        queue.drain().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(queue.stats().failed, 1);
        let captured = reporter.captured();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, JOB_ERROR_CATEGORY);
        assert!(captured[0].1.contains("shard unavailable"));
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let (queue, reporter) = queue();
        let attempts = Arc::new(AtomicU64::new(0));
        queue.enqueue(
            Flaky {
                attempts: attempts.clone(),
                succeed_on: u64::MAX,
                fatal: true,
            },
            args("lane", 4),
        );

        queue.drain().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.captured().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_waits_for_follow_up_jobs() {
        let (queue, _) = queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.enqueue(FanOut { log: log.clone() }, args("parent", 1));

        queue.drain().await;
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.stats().enqueued, 4);
    }

    #[tokio::test]
    async fn test_idle_lanes_are_retired() {
        let (queue, _) = queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        for key in ["a", "b"] {
            queue.enqueue(
                Record {
                    log: log.clone(),
                    label: key.to_string(),
                    delay_ms: 5,
                },
                args(key, 1),
            );
        }
        assert!(queue.active_lanes() > 0);

        queue.drain().await;
        assert_eq!(queue.active_lanes(), 0);

        // A retired strand starts a fresh lane.
        queue.enqueue(
            Record {
                log: log.clone(),
                label: "a-again".to_string(),
                delay_ms: 0,
            },
            args("a", 1),
        );
        queue.drain().await;
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(queue.active_lanes(), 0);
    }

    #[test]
    fn test_backoff_is_capped() {
        use backoff::backoff::Backoff;

        let mut backoff = JobQueueConfig::default().backoff();
        let mut next_ms = || backoff.next_backoff().map(|d| d.as_millis());
        assert_eq!(next_ms(), Some(500));
        assert_eq!(next_ms(), Some(1000));
        for _ in 0..10 {
            next_ms();
        }
        assert_eq!(next_ms(), Some(30_000));
    }
}
