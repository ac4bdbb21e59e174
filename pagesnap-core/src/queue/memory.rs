use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    error::{CaptureError, Result},
    request::CaptureRequest,
    results::ResultRecord,
};

use super::{
    DequeueRequest, EnqueueOptions, JobHandle, JobId, JobLease, JobQueue,
    JobRecord, JobState, LeaseId, LeaseRenewal, QueueCounts, QueueSettings,
    STALLED_FAILURE_REASON, StalledScan,
};

#[derive(Debug)]
struct Entry {
    record: JobRecord,
    remove_after: Option<Duration>,
    remove_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn finish(&mut self, state: JobState, now: DateTime<Utc>) {
        self.record.state = state;
        self.record.finished_at = Some(now);
        self.release_lease();
        self.remove_at = self
            .remove_after
            .and_then(|grace| chrono::Duration::from_std(grace).ok())
            .map(|grace| now + grace);
    }

    fn release_lease(&mut self) {
        self.record.lease_id = None;
        self.record.lease_owner = None;
        self.record.lease_expires_at = None;
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    waiting: VecDeque<JobId>,
    completed_total: u64,
    failed_total: u64,
}

impl State {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.jobs
            .retain(|_, entry| entry.remove_at.is_none_or(|at| at > now));
    }

    fn held(&mut self, id: &JobId, lease_id: LeaseId) -> Result<&mut Entry> {
        let entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| CaptureError::NotFound(id.to_string()))?;
        if entry.record.state != JobState::Active
            || entry.record.lease_id != Some(lease_id)
        {
            return Err(CaptureError::LockLost(id.to_string()));
        }
        Ok(entry)
    }
}

/// Process-local queue for single-node deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobQueue {
    settings: QueueSettings,
    state: Arc<Mutex<State>>,
}

impl InMemoryJobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Arc::new(Mutex::new(State::default())),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn add(
        &self,
        id: &JobId,
        payload: &CaptureRequest,
        options: EnqueueOptions,
    ) -> Result<JobHandle> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        if let Some(existing) = state.jobs.get(id) {
            debug!(job = %id, state = %existing.record.state, "duplicate job id merged");
            return Ok(JobHandle::merged(id.clone(), existing.record.state));
        }

        let record = JobRecord {
            id: id.clone(),
            payload: payload.clone(),
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            stalled_count: 0,
            lease_id: None,
            lease_owner: None,
            lease_expires_at: None,
            renewals: 0,
            result: None,
            failed_reason: None,
            created_at: now,
            finished_at: None,
        };
        state.jobs.insert(
            id.clone(),
            Entry {
                record,
                remove_after: options.remove_after,
                remove_at: None,
            },
        );
        state.waiting.push_back(id.clone());
        Ok(JobHandle::accepted(id.clone()))
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let mut state = self.state.lock().await;
        state.purge_expired(Utc::now());
        Ok(state.jobs.get(id).map(|entry| entry.record.clone()))
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        while let Some(id) = state.waiting.pop_front() {
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            if entry.record.state != JobState::Waiting {
                continue;
            }

            let lease_id = LeaseId::new();
            let expires_at = now + request.lease_ttl;
            entry.record.state = JobState::Active;
            entry.record.attempts += 1;
            entry.record.lease_id = Some(lease_id);
            entry.record.lease_owner = Some(request.worker_id.clone());
            entry.record.lease_expires_at = Some(expires_at);
            entry.record.renewals = 0;

            return Ok(Some(JobLease {
                lease_id,
                job: entry.record.clone(),
                lease_owner: request.worker_id,
                expires_at,
                renewals: 0,
            }));
        }
        Ok(None)
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<JobLease> {
        let mut state = self.state.lock().await;
        let entry = state.held(&renewal.job_id, renewal.lease_id)?;

        let expires_at = Utc::now() + renewal.extend_by;
        entry.record.lease_expires_at = Some(expires_at);
        entry.record.renewals += 1;

        Ok(JobLease {
            lease_id: renewal.lease_id,
            job: entry.record.clone(),
            lease_owner: renewal.worker_id,
            expires_at,
            renewals: entry.record.renewals,
        })
    }

    async fn complete(&self, id: &JobId, lease_id: LeaseId, result: &ResultRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.held(id, lease_id)?;
        entry.record.result = Some(result.clone());
        entry.finish(JobState::Completed, Utc::now());
        state.completed_total += 1;
        Ok(())
    }

    async fn fail(
        &self,
        id: &JobId,
        lease_id: LeaseId,
        error: &str,
        retryable: bool,
    ) -> Result<JobState> {
        let mut state = self.state.lock().await;
        let entry = state.held(id, lease_id)?;
        entry.record.failed_reason = Some(error.to_string());

        if retryable && entry.record.attempts < entry.record.max_attempts {
            entry.record.state = JobState::Waiting;
            entry.release_lease();
            state.waiting.push_back(id.clone());
            return Ok(JobState::Waiting);
        }

        entry.finish(JobState::Failed, Utc::now());
        state.failed_total += 1;
        Ok(JobState::Failed)
    }

    async fn scan_stalled(&self) -> Result<StalledScan> {
        let now = Utc::now();
        let max_stalled = self.settings.max_stalled_count;
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        let mut scan = StalledScan::default();
        for (id, entry) in state.jobs.iter_mut() {
            let expired = entry.record.state == JobState::Active
                && entry.record.lease_expires_at.is_some_and(|at| at <= now);
            if !expired {
                continue;
            }

            entry.record.stalled_count += 1;
            if entry.record.stalled_count > max_stalled {
                warn!(job = %id, stalled = entry.record.stalled_count, "stalled job failed");
                entry.record.failed_reason =
                    Some(STALLED_FAILURE_REASON.to_string());
                entry.finish(JobState::Failed, now);
                scan.failed.push(id.clone());
            } else {
                entry.record.state = JobState::Waiting;
                entry.release_lease();
                scan.recovered.push(id.clone());
            }
        }

        state.failed_total += scan.failed.len() as u64;
        state.waiting.extend(scan.recovered.iter().cloned());
        Ok(scan)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let mut state = self.state.lock().await;
        state.purge_expired(Utc::now());
        let mut counts = QueueCounts {
            completed: state.completed_total,
            failed: state.failed_total,
            ..QueueCounts::default()
        };
        for entry in state.jobs.values() {
            match entry.record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed | JobState::Failed => {}
            }
        }
        Ok(counts)
    }
}
