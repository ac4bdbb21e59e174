//! Durable job queue with id-based deduplication.
//!
//! A job id maps to at most one queue entry. Adding an id that already
//! exists, in any state, returns the existing entry instead of creating a
//! second one; the check-and-insert is atomic inside the backend. Claimed
//! jobs carry a lease that the worker renews; leases that lapse are picked
//! up by [`JobQueue::scan_stalled`] and retried a bounded number of times.

pub mod job;
pub mod lease;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_queue;

use std::fmt;

use async_trait::async_trait;

use crate::{error::Result, request::CaptureRequest, results::ResultRecord};

pub use job::{
    EnqueueOptions, JobHandle, JobId, JobRecord, JobState, QueueCounts,
    STALLED_FAILURE_REASON, StalledScan,
};
pub use lease::{DequeueRequest, JobLease, LeaseId, LeaseRenewal};
pub use memory::InMemoryJobQueue;
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;

/// Queue-wide behaviour shared by every backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    /// Key namespace for shared backends.
    pub prefix: String,
    /// Lock expiries tolerated before a job is failed as stalled.
    pub max_stalled_count: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: "pagesnap".into(),
            max_stalled_count: 1,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync + fmt::Debug {
    /// Inserts a waiting job unless one with the same id already exists.
    async fn add(
        &self,
        id: &JobId,
        payload: &CaptureRequest,
        options: EnqueueOptions,
    ) -> Result<JobHandle>;

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>>;

    async fn state(&self, id: &JobId) -> Result<Option<JobState>> {
        Ok(self.get(id).await?.map(|job| job.state))
    }

    /// Claims the oldest waiting job, moving it to active under a new lease.
    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>>;

    /// Extends a held lease. Fails with `LockLost` once the lease is no
    /// longer the job's current one.
    async fn renew(&self, renewal: LeaseRenewal) -> Result<JobLease>;

    /// Marks the job completed with its result and schedules removal.
    async fn complete(&self, id: &JobId, lease_id: LeaseId, result: &ResultRecord) -> Result<()>;

    /// Records a failure. Retryable failures go back to waiting while
    /// attempts remain; otherwise the job is failed and scheduled for
    /// removal. Returns the state the job ended up in.
    async fn fail(
        &self,
        id: &JobId,
        lease_id: LeaseId,
        error: &str,
        retryable: bool,
    ) -> Result<JobState>;

    /// Returns expired active jobs to waiting, or fails them once they have
    /// stalled more than the configured limit.
    async fn scan_stalled(&self) -> Result<StalledScan>;

    async fn counts(&self) -> Result<QueueCounts>;
}
