//! Event envelopes and their streaming wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jobs::types::{JobId, JobMetadata, RunId};

/// Job lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEventType {
    Queued,
    Started,
    Progress,
    Retry,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Queued => "job.queued",
            JobEventType::Started => "job.started",
            JobEventType::Progress => "job.progress",
            JobEventType::Retry => "job.retry",
            JobEventType::Completed => "job.completed",
            JobEventType::Failed => "job.failed",
            JobEventType::Cancelled => "job.cancelled",
            JobEventType::Timeout => "job.timeout",
        }
    }
}

/// One immutable lifecycle occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            job_id: None,
            run_id: None,
            timestamp: Utc::now(),
            payload: Map::new(),
        }
    }

    /// Lifecycle event for a job, carrying its kind and status.
    pub fn job(event_type: JobEventType, job: &JobMetadata) -> Self {
        Self::new(event_type.as_str())
            .for_run(job.job_id, job.run_id)
            .with("kind", job.kind.as_str())
            .with("status", job.status.as_str())
    }

    pub fn for_run(mut self, job_id: JobId, run_id: RunId) -> Self {
        self.job_id = Some(job_id);
        self.run_id = Some(run_id);
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }
}
