//! In-memory job queue. The single owner of job records.
//!
//! # Responsibilities
//! - Admit jobs, deduplicating by idempotency key within a window
//! - Hand queued jobs to workers, highest priority first then FIFO
//! - Apply every status, retry and progress mutation
//! - Emit one lifecycle event per mutation
//!
//! # Design Decisions
//! - Records live in a `DashMap`; a mutation holds that job's entry for its
//!   whole duration, so transitions for one job never interleave
//! - Events for a job are emitted while its entry is held, so per-run event
//!   order matches transition order
//! - Cancellation marks the record immediately and fires the job's token;
//!   the executor observes the token at its checkpoints

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::schema::JobsConfig;
use crate::events::{EventBridge, EventEnvelope, JobEventType};
use crate::jobs::types::{
    EnqueueOptions, EnqueueReceipt, JobFilter, JobId, JobKind, JobMetadata, JobPage, JobStatus, Priority, RunId,
};
use crate::observability::metrics::MetricsCollector;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("queue is closed")]
    Closed,

    #[error("cursor {0} no longer refers to a known job")]
    CursorExpired(JobId),
}

/// Defaults applied when the enqueue call leaves them open.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub default_max_retries: u32,
    pub default_timeout_ms: Option<u64>,
    pub dedup_window: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&JobsConfig::default())
    }
}

impl From<&JobsConfig> for QueueSettings {
    fn from(config: &JobsConfig) -> Self {
        Self {
            default_max_retries: config.default_max_retries,
            default_timeout_ms: config.default_timeout_ms,
            dedup_window: Duration::from_secs(config.dedup_window_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timeout: usize,
}

struct JobEntry {
    meta: JobMetadata,
    cancel: CancellationToken,
}

struct IdempotencyRecord {
    job_id: JobId,
    run_id: RunId,
    created: Instant,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PendingJob {
    priority: Priority,
    order: Reverse<u64>,
    job_id: JobId,
}

pub struct JobQueue {
    records: DashMap<JobId, JobEntry>,
    idempotency: DashMap<String, IdempotencyRecord>,
    pending: Mutex<BinaryHeap<PendingJob>>,
    available: Notify,
    seq: AtomicU64,
    closed: AtomicBool,
    settings: QueueSettings,
    events: Option<Arc<EventBridge>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

impl JobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            records: DashMap::new(),
            idempotency: DashMap::new(),
            pending: Mutex::new(BinaryHeap::new()),
            available: Notify::new(),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            settings,
            events: None,
            metrics: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBridge>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Admit a job. A repeated idempotency key inside the dedup window
    /// returns the original ids instead of creating a second job.
    pub fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueReceipt, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let Some(key) = options.idempotency_key.clone() else {
            return Ok(self.admit(kind, payload, options));
        };

        // The key's entry stays locked until the job exists.
        match self.idempotency.entry(key) {
            Entry::Occupied(existing) if existing.get().created.elapsed() < self.settings.dedup_window => {
                let record = existing.get();
                tracing::debug!(job_id = %record.job_id, key = %existing.key(), "Idempotent enqueue deduplicated");
                Ok(EnqueueReceipt {
                    job_id: record.job_id,
                    run_id: record.run_id,
                    deduplicated: true,
                })
            }
            Entry::Occupied(mut expired) => {
                let receipt = self.admit(kind, payload, options);
                expired.insert(IdempotencyRecord {
                    job_id: receipt.job_id,
                    run_id: receipt.run_id,
                    created: Instant::now(),
                });
                Ok(receipt)
            }
            Entry::Vacant(slot) => {
                let receipt = self.admit(kind, payload, options);
                slot.insert(IdempotencyRecord {
                    job_id: receipt.job_id,
                    run_id: receipt.run_id,
                    created: Instant::now(),
                });
                Ok(receipt)
            }
        }
    }

    fn admit(&self, kind: JobKind, payload: serde_json::Value, options: EnqueueOptions) -> EnqueueReceipt {
        let meta = JobMetadata {
            job_id: JobId::new(),
            run_id: RunId::new(),
            kind,
            status: JobStatus::Queued,
            priority: options.priority,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress: 0,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.settings.default_max_retries),
            timeout_ms: options.timeout_ms.or(self.settings.default_timeout_ms),
            payload,
            error: None,
            idempotency_key: options.idempotency_key,
            mock: options.mock,
            artifacts: Vec::new(),
        };
        let receipt = EnqueueReceipt {
            job_id: meta.job_id,
            run_id: meta.run_id,
            deduplicated: false,
        };

        tracing::info!(
            job_id = %meta.job_id,
            run_id = %meta.run_id,
            kind = %kind,
            priority = ?meta.priority,
            "Job queued"
        );
        self.emit(JobEventType::Queued, &meta, |e| e);

        let priority = meta.priority;
        self.records.insert(
            meta.job_id,
            JobEntry {
                meta,
                cancel: CancellationToken::new(),
            },
        );
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).push(PendingJob {
            priority,
            order: Reverse(self.seq.fetch_add(1, Ordering::Relaxed)),
            job_id: receipt.job_id,
        });
        self.available.notify_one();
        receipt
    }

    pub fn get(&self, job_id: JobId) -> Option<JobMetadata> {
        self.records.get(&job_id).map(|entry| entry.meta.clone())
    }

    /// Newest first, paged by the last job id of the previous page.
    ///
    /// The cursor resolves to its `(created_at, job_id)` sort key before
    /// filtering, so a cursor job that has since changed status still marks
    /// where the next page starts.
    pub fn list(&self, filter: &JobFilter) -> Result<JobPage, QueueError> {
        let after = match filter.cursor {
            Some(cursor) => {
                let entry = self.records.get(&cursor).ok_or(QueueError::CursorExpired(cursor))?;
                Some((entry.meta.created_at, entry.meta.job_id))
            }
            None => None,
        };

        let mut jobs: Vec<JobMetadata> = self
            .records
            .iter()
            .filter(|entry| filter.matches(&entry.meta))
            .filter(|entry| after.map_or(true, |key| (entry.meta.created_at, entry.meta.job_id) < key))
            .map(|entry| entry.meta.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.job_id.cmp(&a.job_id)));

        let limit = filter.effective_limit();
        let has_more = jobs.len() > limit;
        jobs.truncate(limit);
        Ok(JobPage {
            cursor: if has_more { jobs.last().map(|job| job.job_id) } else { None },
            jobs,
            has_more,
        })
    }

    /// Cancel a queued or running job. Returns false for unknown or finished jobs.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let Some(mut entry) = self.records.get_mut(&job_id) else {
            return false;
        };
        if self.transition(&mut *entry, JobStatus::Cancelled).is_err() {
            return false;
        }
        entry.cancel.cancel();
        tracing::info!(job_id = %job_id, "Job cancelled");
        self.emit(JobEventType::Cancelled, &entry.meta, |e| e);
        true
    }

    pub fn cancellation_token(&self, job_id: JobId) -> Option<CancellationToken> {
        self.records.get(&job_id).map(|entry| entry.cancel.clone())
    }

    /// Wait for the next queued job. `None` once closed or `shutdown` fires.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<JobId> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job_id) = self.pop_queued() {
                return Some(job_id);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    fn pop_queued(&self) -> Option<JobId> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(candidate) = pending.pop() {
            let queued = self
                .records
                .get(&candidate.job_id)
                .is_some_and(|entry| entry.meta.status == JobStatus::Queued);
            if queued {
                return Some(candidate.job_id);
            }
        }
        None
    }

    /// `queued → running`. Returns the record as started.
    pub fn start(&self, job_id: JobId) -> Result<JobMetadata, QueueError> {
        self.mutate(job_id, |queue, entry| {
            queue.transition(entry, JobStatus::Running)?;
            tracing::info!(job_id = %job_id, kind = %entry.meta.kind, "Job started");
            queue.emit(JobEventType::Started, &entry.meta, |e| e);
            Ok(entry.meta.clone())
        })
    }

    /// Count a failed attempt that will be retried. Status stays `running`.
    pub fn record_retry(&self, job_id: JobId, error: &str, delay: Duration) -> Result<u32, QueueError> {
        self.mutate(job_id, |queue, entry| {
            queue.require(entry, JobStatus::Running)?;
            entry.meta.retry_count += 1;
            let attempt = entry.meta.retry_count;
            tracing::warn!(
                job_id = %job_id,
                retry = attempt,
                max_retries = entry.meta.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job attempt failed, retrying"
            );
            queue.emit(JobEventType::Retry, &entry.meta, |e| {
                e.with("retryCount", attempt)
                    .with("delayMs", delay.as_millis() as u64)
                    .with("error", error)
            });
            Ok(attempt)
        })
    }

    /// Returns `false` once the job is finished; late reports are ignored.
    pub fn update_progress(&self, job_id: JobId, progress: u8, message: Option<&str>) -> Result<bool, QueueError> {
        self.mutate(job_id, |queue, entry| {
            if entry.meta.status != JobStatus::Running {
                return Ok(false);
            }
            entry.meta.progress = progress.min(100);
            let progress = entry.meta.progress;
            queue.emit(JobEventType::Progress, &entry.meta, |e| {
                let e = e.with("progress", progress);
                match message {
                    Some(message) => e.with("message", message),
                    None => e,
                }
            });
            Ok(true)
        })
    }

    pub fn complete(&self, job_id: JobId, artifacts: Vec<String>) -> Result<(), QueueError> {
        self.mutate(job_id, |queue, entry| {
            queue.transition(entry, JobStatus::Completed)?;
            entry.meta.progress = 100;
            entry.meta.artifacts = artifacts;
            tracing::info!(
                job_id = %job_id,
                retries = entry.meta.retry_count,
                artifacts = entry.meta.artifacts.len(),
                "Job completed"
            );
            let artifacts = entry.meta.artifacts.clone();
            queue.emit(JobEventType::Completed, &entry.meta, |e| {
                e.with("progress", 100).with("artifacts", artifacts)
            });
            Ok(())
        })
    }

    pub fn fail(&self, job_id: JobId, error: impl Into<String>) -> Result<(), QueueError> {
        let error = error.into();
        self.mutate(job_id, |queue, entry| {
            queue.transition(entry, JobStatus::Failed)?;
            entry.meta.error = Some(error.clone());
            tracing::warn!(job_id = %job_id, retries = entry.meta.retry_count, error = %error, "Job failed");
            queue.emit(JobEventType::Failed, &entry.meta, |e| e.with("error", error.as_str()));
            Ok(())
        })
    }

    pub fn time_out(&self, job_id: JobId, message: impl Into<String>) -> Result<(), QueueError> {
        let message = message.into();
        self.mutate(job_id, |queue, entry| {
            queue.transition(entry, JobStatus::Timeout)?;
            entry.meta.error = Some(message.clone());
            entry.cancel.cancel();
            tracing::warn!(job_id = %job_id, error = %message, "Job timed out");
            queue.emit(JobEventType::Timeout, &entry.meta, |e| e.with("error", message.as_str()));
            Ok(())
        })
    }

    /// Forget finished jobs older than `older_than`. Returns how many went.
    pub fn prune_terminal(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut runs = Vec::new();
        self.records.retain(|_, entry| match entry.meta.finished_at {
            Some(finished) if entry.meta.status.is_terminal() && finished <= cutoff => {
                runs.push(entry.meta.run_id);
                false
            }
            _ => true,
        });
        if runs.is_empty() {
            return 0;
        }
        self.idempotency.retain(|_, record| self.records.contains_key(&record.job_id));
        if let Some(events) = &self.events {
            for run in &runs {
                events.drop_run(*run);
            }
        }
        tracing::debug!(pruned = runs.len(), "Pruned finished jobs");
        runs.len()
    }

    /// Refuse new jobs and wake idle workers so they can exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.records.iter() {
            match entry.meta.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Timeout => stats.timeout += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn mutate<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&Self, &mut JobEntry) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut entry = self.records.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        f(self, &mut *entry)
    }

    fn require(&self, entry: &JobEntry, status: JobStatus) -> Result<(), QueueError> {
        if entry.meta.status == status {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                job_id: entry.meta.job_id,
                from: entry.meta.status,
                to: status,
            })
        }
    }

    fn transition(&self, entry: &mut JobEntry, to: JobStatus) -> Result<(), QueueError> {
        let from = entry.meta.status;
        if !from.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                job_id: entry.meta.job_id,
                from,
                to,
            });
        }

        entry.meta.status = to;
        let now = Utc::now();
        if to == JobStatus::Running {
            entry.meta.started_at = Some(now);
        }
        if to.is_terminal() {
            entry.meta.finished_at = Some(now);
            if let Some(metrics) = &self.metrics {
                metrics.record_job(entry.meta.kind.as_str(), to.as_str());
            }
        }
        Ok(())
    }

    fn emit(&self, event_type: JobEventType, meta: &JobMetadata, build: impl FnOnce(EventEnvelope) -> EventEnvelope) {
        if let Some(events) = &self.events {
            events.emit(build(EventEnvelope::job(event_type, meta)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> JobQueue {
        JobQueue::default()
    }

    fn keyed(key: &str) -> EnqueueOptions {
        EnqueueOptions {
            idempotency_key: Some(key.to_string()),
            ..EnqueueOptions::default()
        }
    }

    #[test]
    fn idempotent_enqueue_returns_same_ids() {
        let queue = queue();
        let first = queue.enqueue(JobKind::Audit, json!({}), keyed("k1")).unwrap();
        queue.start(first.job_id).unwrap();
        let second = queue.enqueue(JobKind::Audit, json!({}), keyed("k1")).unwrap();

        assert_eq!((first.job_id, first.run_id), (second.job_id, second.run_id));
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn expired_key_creates_new_job() {
        let queue = JobQueue::new(QueueSettings {
            dedup_window: Duration::ZERO,
            ..QueueSettings::default()
        });
        let first = queue.enqueue(JobKind::Audit, json!({}), keyed("k")).unwrap();
        let second = queue.enqueue(JobKind::Audit, json!({}), keyed("k")).unwrap();
        assert_ne!(first.job_id, second.job_id);
    }

    #[test]
    fn defaults_fill_open_options() {
        let queue = JobQueue::new(QueueSettings {
            default_max_retries: 3,
            default_timeout_ms: Some(1_000),
            dedup_window: Duration::from_secs(60),
        });
        let receipt = queue.enqueue(JobKind::Release, json!({"v": 1}), EnqueueOptions::default()).unwrap();
        let job = queue.get(receipt.job_id).unwrap();
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.timeout_ms, Some(1_000));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.run_id, receipt.run_id);
    }

    #[tokio::test]
    async fn dequeues_by_priority_then_fifo() {
        let queue = queue();
        let low = queue
            .enqueue(
                JobKind::Audit,
                json!({}),
                EnqueueOptions {
                    priority: Priority::Low,
                    ..Default::default()
                },
            )
            .unwrap();
        let normal_a = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap();
        let normal_b = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap();
        let high = queue
            .enqueue(
                JobKind::Audit,
                json!({}),
                EnqueueOptions {
                    priority: Priority::High,
                    ..Default::default()
                },
            )
            .unwrap();

        let token = CancellationToken::new();
        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(queue.next(&token).await.unwrap());
        }
        assert_eq!(order, vec![high.job_id, normal_a.job_id, normal_b.job_id, low.job_id]);
    }

    #[tokio::test]
    async fn cancelled_jobs_are_skipped_by_next() {
        let queue = queue();
        let a = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap();
        let b = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap();
        assert!(queue.cancel(a.job_id));

        let token = CancellationToken::new();
        assert_eq!(queue.next(&token).await, Some(b.job_id));
        assert_eq!(queue.get(a.job_id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn next_returns_none_on_shutdown_or_close() {
        let queue = Arc::new(queue());
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(queue.next(&token).await, None);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next(&CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(
            queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let queue = queue();
        let r = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap();
        queue.start(r.job_id).unwrap();
        queue.complete(r.job_id, vec![]).unwrap();

        assert!(!queue.cancel(r.job_id));
        assert!(matches!(queue.fail(r.job_id, "x"), Err(QueueError::InvalidTransition { .. })));
        assert_eq!(queue.update_progress(r.job_id, 10, None), Ok(false));

        let job = queue.get(r.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn cancel_fires_token() {
        let queue = queue();
        let r = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap();
        queue.start(r.job_id).unwrap();
        let token = queue.cancellation_token(r.job_id).unwrap();
        assert!(queue.cancel(r.job_id));
        assert!(token.is_cancelled());
        assert!(!queue.cancel(JobId::new()));
    }

    #[test]
    fn retries_keep_running_status() {
        let queue = queue();
        let r = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap();
        assert!(queue.record_retry(r.job_id, "boom", Duration::ZERO).is_err());
        queue.start(r.job_id).unwrap();
        assert_eq!(queue.record_retry(r.job_id, "boom", Duration::ZERO), Ok(1));
        assert_eq!(queue.record_retry(r.job_id, "boom", Duration::ZERO), Ok(2));

        let job = queue.get(r.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.retry_count, 2);
    }

    #[test]
    fn list_pages_newest_first() {
        let queue = queue();
        let ids: Vec<JobId> = (0..5)
            .map(|_| {
                let id = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap().job_id;
                std::thread::sleep(Duration::from_millis(2));
                id
            })
            .collect();
        queue.enqueue(JobKind::Release, json!({}), EnqueueOptions::default()).unwrap();

        let filter = JobFilter {
            kind: Some(JobKind::Audit),
            limit: Some(2),
            ..JobFilter::default()
        };
        let first = queue.list(&filter).unwrap();
        assert_eq!(first.jobs.iter().map(|j| j.job_id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);
        assert!(first.has_more);

        let third = queue.list(&JobFilter {
            cursor: Some(ids[1]),
            ..filter.clone()
        })
        .unwrap();
        assert_eq!(third.jobs.len(), 1);
        assert_eq!(third.jobs[0].job_id, ids[0]);
        assert!(!third.has_more);
        assert!(third.cursor.is_none());
    }

    #[test]
    fn cursor_survives_status_change_between_pages() {
        let queue = queue();
        let ids: Vec<JobId> = (0..3)
            .map(|_| {
                let id = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap().job_id;
                std::thread::sleep(Duration::from_millis(2));
                id
            })
            .collect();

        let filter = JobFilter {
            status: Some(JobStatus::Queued),
            limit: Some(1),
            ..JobFilter::default()
        };
        let first = queue.list(&filter).unwrap();
        assert_eq!(first.jobs[0].job_id, ids[2]);
        assert_eq!(first.cursor, Some(ids[2]));

        // The cursor job no longer matches the status filter.
        queue.start(ids[2]).unwrap();

        let second = queue
            .list(&JobFilter {
                cursor: first.cursor,
                ..filter.clone()
            })
            .unwrap();
        assert_eq!(second.jobs.iter().map(|j| j.job_id).collect::<Vec<_>>(), vec![ids[1]]);
        assert!(second.has_more);

        let third = queue
            .list(&JobFilter {
                cursor: second.cursor,
                ..filter
            })
            .unwrap();
        assert_eq!(third.jobs[0].job_id, ids[0]);
        assert!(!third.has_more);
    }

    #[test]
    fn pruned_cursor_is_reported() {
        let queue = queue();
        let r = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap();
        queue.start(r.job_id).unwrap();
        queue.complete(r.job_id, Vec::new()).unwrap();
        assert_eq!(queue.prune_terminal(Duration::ZERO), 1);

        let err = queue
            .list(&JobFilter {
                cursor: Some(r.job_id),
                ..JobFilter::default()
            })
            .unwrap_err();
        assert_eq!(err, QueueError::CursorExpired(r.job_id));
    }

    #[test]
    fn lifecycle_events_are_emitted_in_order() {
        let bridge = Arc::new(EventBridge::new(50));
        let queue = JobQueue::default().with_events(bridge.clone());
        let r = queue.enqueue(JobKind::LinkCheck, json!({}), EnqueueOptions::default()).unwrap();
        queue.start(r.job_id).unwrap();
        queue.update_progress(r.job_id, 50, Some("half")).unwrap();
        queue.record_retry(r.job_id, "flaky", Duration::from_millis(10)).unwrap();
        queue.fail(r.job_id, "gave up").unwrap();

        let types: Vec<String> = bridge.history(r.run_id).into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec!["job.queued", "job.started", "job.progress", "job.retry", "job.failed"]);
        let failed = bridge.history(r.run_id).pop().unwrap();
        assert_eq!(failed.payload["error"], "gave up");
        assert_eq!(failed.job_id, Some(r.job_id));
    }

    #[test]
    fn terminal_jobs_count_in_metrics() {
        let metrics = Arc::new(MetricsCollector::new());
        let queue = JobQueue::default().with_metrics(metrics.clone());
        let r = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap();
        queue.start(r.job_id).unwrap();
        queue.time_out(r.job_id, "deadline").unwrap();

        assert_eq!(metrics.snapshot().jobs["audit"]["timeout"], 1);
        assert_eq!(queue.stats().timeout, 1);
    }

    #[test]
    fn prune_removes_old_finished_jobs() {
        let queue = queue();
        let done = queue.enqueue(JobKind::Audit, json!({}), keyed("a")).unwrap();
        let waiting = queue.enqueue(JobKind::Audit, json!({}), EnqueueOptions::default()).unwrap();
        queue.cancel(done.job_id);

        assert_eq!(queue.prune_terminal(Duration::ZERO), 1);
        assert!(queue.get(done.job_id).is_none());
        assert!(queue.get(waiting.job_id).is_some());
    }
}
