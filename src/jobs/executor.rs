//! Job execution: handler dispatch, retries, deadlines, artifacts.
//!
//! # Responsibilities
//! - Pull queued jobs and run them on a fixed pool of worker tasks
//! - Retry failed attempts with backoff until `maxRetries` is spent
//! - Enforce the per-job deadline and observe cancellation
//! - Persist produced artifacts and report the terminal state
//!
//! # Design Decisions
//! - Every mutation goes through `JobQueue`; the executor never edits records
//! - Each attempt runs in its own task so a panicking handler becomes an
//!   ordinary failed attempt
//! - Cancellation is checked before start, between attempts and during
//!   the backoff sleep

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::jobs::artifacts::{ArtifactError, ArtifactStore};
use crate::jobs::command::CommandError;
use crate::jobs::queue::{JobQueue, QueueError};
use crate::jobs::types::{JobId, JobKind, JobMetadata, JobStatus, RunId};
use crate::resilience::backoff::BackoffPolicy;

#[derive(Debug, Error)]
pub enum JobError {
    /// The handler ran and reported failure.
    #[error("{0}")]
    Reported(String),

    #[error("handler panicked")]
    Panicked,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("job cancelled")]
    Cancelled,

    #[error("no handler registered for job kind {0}")]
    NoHandler(JobKind),
}

impl JobError {
    pub fn reported(message: impl Into<String>) -> Self {
        JobError::Reported(message.into())
    }
}

/// A named output of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub content: Vec<u8>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub artifacts: Vec<Artifact>,
}

impl JobOutput {
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// Lets a handler report progress through the queue.
#[derive(Clone)]
pub struct ProgressReporter {
    queue: Arc<JobQueue>,
    job_id: JobId,
}

impl ProgressReporter {
    pub fn new(queue: Arc<JobQueue>, job_id: JobId) -> Self {
        Self { queue, job_id }
    }

    /// Ignored once the job has finished.
    pub fn report(&self, percent: u8, message: Option<&str>) {
        if let Err(e) = self.queue.update_progress(self.job_id, percent, message) {
            tracing::debug!(job_id = %self.job_id, error = %e, "Progress report dropped");
        }
    }
}

/// Everything a handler gets to see about the run.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub run_id: RunId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub execution_root: PathBuf,
    /// Zero-based attempt number.
    pub attempt: u32,
    pub mock: bool,
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<JobOutput, JobError>;
}

pub struct JobExecutor {
    queue: Arc<JobQueue>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    artifacts: Arc<dyn ArtifactStore>,
    backoff: BackoffPolicy,
    execution_root: PathBuf,
    workers: usize,
}

impl JobExecutor {
    pub fn new(queue: Arc<JobQueue>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            artifacts,
            backoff: BackoffPolicy::default(),
            execution_root: PathBuf::from("."),
            workers: 1,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_execution_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.execution_root = root.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn register(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Register the same handler for every job kind.
    pub fn register_all(mut self, handler: Arc<dyn JobHandler>) -> Self {
        for kind in JobKind::ALL {
            self.handlers.insert(kind, handler.clone());
        }
        self
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Start the worker pool. Workers exit when `shutdown` fires or the queue closes.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(workers = self.workers, kinds = self.handlers.len(), "Job executor starting");
        (0..self.workers)
            .map(|worker| {
                let executor = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    while let Some(job_id) = executor.queue.next(&shutdown).await {
                        executor.execute(job_id).await;
                    }
                    tracing::debug!(worker, "Job worker exiting");
                })
            })
            .collect()
    }

    /// Run one job to a terminal state.
    pub async fn execute(&self, job_id: JobId) {
        let Some(token) = self.queue.cancellation_token(job_id) else {
            tracing::warn!(job_id = %job_id, "Job vanished before execution");
            return;
        };
        if token.is_cancelled() {
            tracing::debug!(job_id = %job_id, "Job cancelled before start");
            return;
        }

        let job = match self.queue.start(job_id) {
            Ok(job) => job,
            Err(e) => {
                tracing::debug!(job_id = %job_id, error = %e, "Job not startable");
                return;
            }
        };

        let outcome = match job.timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), self.run_attempts(&job, &token)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        token.cancel();
                        self.settle(job_id, self.queue.time_out(job_id, format!("job exceeded deadline of {ms}ms")));
                        return;
                    }
                }
            }
            None => self.run_attempts(&job, &token).await,
        };

        let result = match outcome {
            Ok(artifacts) => self.queue.complete(job_id, artifacts),
            Err(JobError::Cancelled) => Ok(()),
            Err(error) => self.queue.fail(job_id, error.to_string()),
        };
        self.settle(job_id, result);
    }

    /// Attempts until success, cancellation, or retries run out.
    async fn run_attempts(&self, job: &JobMetadata, token: &CancellationToken) -> Result<Vec<String>, JobError> {
        let handler = self.handlers.get(&job.kind).cloned().ok_or(JobError::NoHandler(job.kind))?;
        let mut attempt = 0u32;

        loop {
            if token.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let ctx = JobContext {
                job_id: job.job_id,
                run_id: job.run_id,
                kind: job.kind,
                payload: job.payload.clone(),
                execution_root: self.execution_root.clone(),
                attempt,
                mock: job.mock,
                cancel: token.clone(),
                progress: ProgressReporter::new(self.queue.clone(), job.job_id),
            };

            let error = match self.attempt(handler.clone(), ctx, token).await {
                Ok(output) => return self.store_artifacts(job, output).await,
                Err(JobError::Cancelled) => return Err(JobError::Cancelled),
                Err(error) => error,
            };

            if attempt >= job.max_retries {
                return Err(error);
            }

            let delay = self.backoff.delay(attempt);
            attempt = match self.queue.record_retry(job.job_id, &error.to_string(), delay) {
                Ok(count) => count,
                // Cancelled or timed out in the meantime.
                Err(_) => return Err(JobError::Cancelled),
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return Err(JobError::Cancelled),
            }
        }
    }

    async fn attempt(
        &self,
        handler: Arc<dyn JobHandler>,
        ctx: JobContext,
        token: &CancellationToken,
    ) -> Result<JobOutput, JobError> {
        let job_id = ctx.job_id;
        let mut task = AbortOnDrop(tokio::spawn(async move { handler.run(ctx).await }));

        tokio::select! {
            joined = &mut task.0 => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    tracing::error!(job_id = %job_id, "Job handler panicked");
                    Err(JobError::Panicked)
                }
                Err(_) => Err(JobError::Cancelled),
            },
            _ = token.cancelled() => Err(JobError::Cancelled),
        }
    }

    async fn store_artifacts(&self, job: &JobMetadata, output: JobOutput) -> Result<Vec<String>, JobError> {
        let mut stored = Vec::with_capacity(output.artifacts.len());
        for artifact in &output.artifacts {
            let location = self
                .artifacts
                .write(job.kind, job.run_id, &artifact.name, &artifact.content)
                .await?;
            stored.push(location);
        }
        Ok(stored)
    }

    fn settle(&self, job_id: JobId, result: Result<(), QueueError>) {
        match result {
            Ok(()) => {}
            // Cancelled while finishing; the cancellation already settled it.
            Err(QueueError::InvalidTransition {
                from: JobStatus::Cancelled,
                ..
            }) => {}
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to record job outcome"),
        }
    }
}

/// Aborts the attempt task if its future is dropped, e.g. by the deadline.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::EnqueueOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        written: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ArtifactStore for MemoryStore {
        async fn write(&self, kind: JobKind, run_id: RunId, name: &str, _: &[u8]) -> Result<String, ArtifactError> {
            let path = crate::jobs::artifacts::artifact_path(kind, run_id, name)?;
            self.written.lock().unwrap().push(path.clone());
            Ok(path)
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn run(&self, ctx: JobContext) -> Result<JobOutput, JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(JobError::reported(format!("attempt {call} failed")));
            }
            ctx.progress.report(50, None);
            Ok(JobOutput::default().with_artifact(Artifact::new("out.txt", "ok")))
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn run(&self, _: JobContext) -> Result<JobOutput, JobError> {
            panic!("boom");
        }
    }

    struct Sleeps;

    #[async_trait]
    impl JobHandler for Sleeps {
        async fn run(&self, _: JobContext) -> Result<JobOutput, JobError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(JobOutput::default())
        }
    }

    fn executor(handler: Arc<dyn JobHandler>) -> (JobExecutor, Arc<JobQueue>, Arc<MemoryStore>) {
        let queue = Arc::new(JobQueue::default());
        let store = Arc::new(MemoryStore::default());
        let executor = JobExecutor::new(queue.clone(), store.clone())
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(10)))
            .register_all(handler);
        (executor, queue, store)
    }

    fn retries(n: u32) -> EnqueueOptions {
        EnqueueOptions {
            max_retries: Some(n),
            ..EnqueueOptions::default()
        }
    }

    #[tokio::test]
    async fn succeeds_after_k_failures() {
        let flaky = Flaky::new(2);
        let (executor, queue, store) = executor(flaky.clone());
        let r = queue.enqueue(JobKind::Audit, json!({}), retries(3)).unwrap();

        executor.execute(r.job_id).await;

        let job = queue.get(r.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.progress, 100);
        assert_eq!(job.artifacts, vec![format!("audit/{}/out.txt", r.run_id)]);
        assert_eq!(store.written.lock().unwrap().len(), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fails_with_original_error_when_retries_exhausted() {
        let (executor, queue, _) = executor(Flaky::new(u32::MAX));
        let r = queue.enqueue(JobKind::Audit, json!({}), retries(2)).unwrap();

        executor.execute(r.job_id).await;

        let job = queue.get(r.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.error.as_deref(), Some("attempt 2 failed"));
    }

    #[tokio::test]
    async fn cancelled_before_start_never_runs() {
        let flaky = Flaky::new(0);
        let (executor, queue, _) = executor(flaky.clone());
        let r = queue.enqueue(JobKind::Audit, json!({}), retries(0)).unwrap();
        queue.cancel(r.job_id);

        executor.execute(r.job_id).await;

        assert_eq!(queue.get(r.job_id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panic_is_a_failed_attempt() {
        let (executor, queue, _) = executor(Arc::new(Panics));
        let r = queue.enqueue(JobKind::Release, json!({}), retries(1)).unwrap();

        executor.execute(r.job_id).await;

        let job = queue.get(r.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.error.as_deref(), Some("handler panicked"));
    }

    #[tokio::test]
    async fn deadline_marks_timeout() {
        let (executor, queue, _) = executor(Arc::new(Sleeps));
        let r = queue
            .enqueue(
                JobKind::LinkCheck,
                json!({}),
                EnqueueOptions {
                    timeout_ms: Some(50),
                    ..EnqueueOptions::default()
                },
            )
            .unwrap();

        executor.execute(r.job_id).await;

        let job = queue.get(r.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert!(job.error.unwrap().contains("50ms"));
    }

    #[tokio::test]
    async fn cancel_while_running_stops_the_attempt() {
        let (executor, queue, _) = executor(Arc::new(Sleeps));
        let executor = Arc::new(executor);
        let r = queue.enqueue(JobKind::Audit, json!({}), retries(5)).unwrap();

        let running = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(r.job_id).await })
        };
        while queue.get(r.job_id).unwrap().status != JobStatus::Running {
            tokio::task::yield_now().await;
        }
        assert!(queue.cancel(r.job_id));
        running.await.unwrap();

        let job = queue.get(r.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let (executor, queue, _) = executor(Flaky::new(0));
        let executor = Arc::new(executor.with_workers(2));
        let shutdown = CancellationToken::new();
        let handles = executor.clone().spawn(shutdown.clone());

        let ids: Vec<JobId> = (0..4)
            .map(|_| queue.enqueue(JobKind::Audit, json!({}), retries(0)).unwrap().job_id)
            .collect();

        for _ in 0..200 {
            if queue.stats().completed == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(queue.stats().completed, 4);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
