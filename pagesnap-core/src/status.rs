//! Resolves a job id to the status clients see.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::Result,
    queue::{JobId, JobQueue, JobState},
    results::{ResultRecord, ResultSource, ResultStatus, ResultStore},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Done {
        #[serde(rename = "imageUrl")]
        image_url: String,
        width: u32,
        height: u32,
        bytes: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<ResultSource>,
    },
    Error {
        error: String,
    },
    NotFound,
}

impl From<ResultRecord> for JobStatus {
    fn from(record: ResultRecord) -> Self {
        match record.status {
            ResultStatus::Done => JobStatus::Done {
                image_url: record.image_url.unwrap_or_default(),
                width: record.width.unwrap_or_default(),
                height: record.height.unwrap_or_default(),
                bytes: record.bytes.unwrap_or_default(),
                source: record.source,
            },
            ResultStatus::Error => JobStatus::Error {
                error: record
                    .error
                    .unwrap_or_else(|| "capture failed".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusPoller {
    results: Arc<dyn ResultStore>,
    queue: Arc<dyn JobQueue>,
    recheck_delay: Duration,
    result_ttl: Duration,
}

impl StatusPoller {
    pub fn new(
        results: Arc<dyn ResultStore>,
        queue: Arc<dyn JobQueue>,
        recheck_delay: Duration,
        result_ttl: Duration,
    ) -> Self {
        Self {
            results,
            queue,
            recheck_delay,
            result_ttl,
        }
    }

    async fn recheck_results(&self, job_id: &JobId) -> Result<Option<ResultRecord>> {
        tokio::time::sleep(self.recheck_delay).await;
        self.results.get(job_id).await
    }

    pub async fn poll(&self, job_id: &JobId) -> Result<JobStatus> {
        if let Some(record) = self.results.get(job_id).await? {
            return Ok(record.into());
        }
        // A just-finished job's record may not be visible yet.
        if let Some(record) = self.recheck_results(job_id).await? {
            return Ok(record.into());
        }

        let Some(job) = self.queue.get(job_id).await? else {
            // Queue cleanup can outrun the result write becoming visible.
            return Ok(match self.recheck_results(job_id).await? {
                Some(record) => record.into(),
                None => JobStatus::NotFound,
            });
        };

        let record = match job.state {
            JobState::Waiting => return Ok(JobStatus::Waiting),
            JobState::Active => return Ok(JobStatus::Active),
            JobState::Completed => match job.result {
                Some(result) => result,
                None => {
                    debug!(job = %job_id, "completed job has no result yet");
                    return Ok(JobStatus::Active);
                }
            },
            JobState::Failed => ResultRecord::error(
                job.failed_reason
                    .unwrap_or_else(|| "capture failed".to_string()),
            ),
        };

        if let Err(err) = self.results.put(job_id, &record, self.result_ttl).await {
            warn!(job = %job_id, "failed to backfill result record: {err}");
        }
        Ok(record.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shapes() {
        assert_eq!(
            serde_json::to_value(JobStatus::Waiting).unwrap(),
            serde_json::json!({"status": "waiting"})
        );
        assert_eq!(
            serde_json::to_value(JobStatus::NotFound).unwrap(),
            serde_json::json!({"status": "not_found"})
        );

        let done: JobStatus = ResultRecord::done(
            "https://cdn/x.jpg",
            10,
            20,
            30,
            ResultSource::Capture,
        )
        .into();
        assert_eq!(
            serde_json::to_value(done).unwrap(),
            serde_json::json!({
                "status": "done",
                "imageUrl": "https://cdn/x.jpg",
                "width": 10,
                "height": 20,
                "bytes": 30,
                "source": "capture"
            })
        );

        let error: JobStatus = ResultRecord::error("navigation failed").into();
        assert_eq!(
            serde_json::to_value(error).unwrap(),
            serde_json::json!({"status": "error", "error": "navigation failed"})
        );
    }
}
