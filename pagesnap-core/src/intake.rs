//! Request admission: validation, SSRF check, cache lookup, enqueue.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    cache_key::{CacheKey, StorageKey},
    error::Result,
    queue::{EnqueueOptions, JobId, JobQueue},
    request::{CaptureRequest, validate_idempotency_key},
    ssrf::SsrfGuard,
    storage::ObjectStore,
};

/// Artifact already stored for a semantically identical request.
///
/// Dimensions and size are not read back from storage and are reported as
/// zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHit {
    pub image_url: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    pub cached: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    CacheHit(CacheHit),
    Enqueued {
        job_id: JobId,
        /// False when the id was already queued and this submission merged
        /// into the existing job.
        accepted: bool,
    },
}

#[derive(Debug, Clone)]
pub struct IntakeService {
    guard: SsrfGuard,
    objects: Arc<dyn ObjectStore>,
    queue: Arc<dyn JobQueue>,
    enqueue_options: EnqueueOptions,
}

impl IntakeService {
    pub fn new(
        guard: SsrfGuard,
        objects: Arc<dyn ObjectStore>,
        queue: Arc<dyn JobQueue>,
        enqueue_options: EnqueueOptions,
    ) -> Self {
        Self {
            guard,
            objects,
            queue,
            enqueue_options,
        }
    }

    pub async fn submit(
        &self,
        request: CaptureRequest,
        idempotency_key: Option<&str>,
    ) -> Result<SubmitOutcome> {
        let url = request.validate()?;
        if let Some(key) = idempotency_key {
            validate_idempotency_key(key)?;
        }
        self.guard.check(&url).await?;

        let cache_key = CacheKey::for_request(&request);
        let storage_key = StorageKey::new(&cache_key, &request);

        if !request.fresh && self.objects.exists(&storage_key).await? {
            debug!(url = %url, key = %storage_key, "cache hit");
            return Ok(SubmitOutcome::CacheHit(CacheHit {
                image_url: self.objects.public_url(&storage_key),
                width: 0,
                height: 0,
                bytes: 0,
                cached: true,
            }));
        }

        let job_id = derive_job_id(&cache_key, idempotency_key, request.fresh);
        let handle = self
            .queue
            .add(&job_id, &request, self.enqueue_options)
            .await?;

        info!(
            job = %handle.job_id,
            url = %url,
            accepted = handle.accepted,
            state = %handle.state,
            "capture enqueued"
        );
        Ok(SubmitOutcome::Enqueued {
            job_id: handle.job_id,
            accepted: handle.accepted,
        })
    }
}

/// Job id for a submission: the idempotency key, else the cache key. Fresh
/// captures get a unique suffix so they never reuse an earlier job's id or
/// result record.
pub fn derive_job_id(cache_key: &CacheKey, idempotency_key: Option<&str>, fresh: bool) -> JobId {
    let base = idempotency_key.unwrap_or(cache_key.as_str());
    if fresh {
        JobId::new(format!("{base}:fresh:{}", Uuid::now_v7().simple()))
    } else {
        JobId::new(base)
    }
}
