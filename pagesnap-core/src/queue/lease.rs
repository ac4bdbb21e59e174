use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{JobId, JobRecord};

/// Lock token held by the worker that claimed a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for LeaseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lease metadata returned when a worker dequeues a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    pub lease_id: LeaseId,
    pub job: JobRecord,
    pub lease_owner: String,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
}

impl JobLease {
    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }
}

/// Request to claim the next waiting job.
#[derive(Clone, Debug)]
pub struct DequeueRequest {
    pub worker_id: String,
    pub lease_ttl: chrono::Duration,
}

/// Payload provided when renewing a lease.
#[derive(Clone, Debug)]
pub struct LeaseRenewal {
    pub job_id: JobId,
    pub lease_id: LeaseId,
    pub worker_id: String,
    pub extend_by: chrono::Duration,
}
