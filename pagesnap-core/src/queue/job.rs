use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{request::CaptureRequest, results::ResultRecord};

use super::lease::LeaseId;

/// Queue identity of a capture job.
///
/// Either the client's `Idempotency-Key`, the request's cache key, or a
/// cache key namespaced with a submission timestamp for fresh captures.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a job as held by the queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: CaptureRequest,
    pub state: JobState,
    /// Number of times the job has been claimed by a worker.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Number of times the job's lock expired while active.
    pub stalled_count: u32,
    pub lease_id: Option<LeaseId>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub renewals: u32,
    /// Return value of a completed job.
    pub result: Option<ResultRecord>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-job enqueue settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Attempts allowed for retryable failures (storage errors).
    pub max_attempts: u32,
    /// How long a finished job remains queryable before removal. `None`
    /// keeps it until explicitly deleted.
    pub remove_after: Option<Duration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            remove_after: Some(Duration::from_secs(60)),
        }
    }
}

/// Outcome of `add`: the job that now owns the id, and whether this call
/// created it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub accepted: bool,
    pub state: JobState,
}

impl JobHandle {
    pub fn accepted(job_id: JobId) -> Self {
        Self {
            job_id,
            accepted: true,
            state: JobState::Waiting,
        }
    }

    pub fn merged(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            accepted: false,
            state,
        }
    }
}

/// Jobs touched by a stalled-lock scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StalledScan {
    /// Returned to waiting for another attempt.
    pub recovered: Vec<JobId>,
    /// Exceeded the stall budget and were failed.
    pub failed: Vec<JobId>,
}

impl StalledScan {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.failed.is_empty()
    }
}

/// Current waiting/active depth plus lifetime completion totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Reason recorded on jobs failed by the stall scan.
pub const STALLED_FAILURE_REASON: &str =
    "job stalled more than the allowable limit";
