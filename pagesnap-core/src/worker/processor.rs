use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    cache_key::{ARTIFACT_CONTENT_TYPE, StorageKey},
    capture::CaptureEngine,
    error::{CaptureError, Result},
    fallback::FallbackResolver,
    queue::JobRecord,
    results::{ResultRecord, ResultSource},
    storage::ObjectStore,
};

/// Executes a single capture job, start to uploaded artifact.
#[derive(Debug, Clone)]
pub struct JobProcessor {
    engine: CaptureEngine,
    objects: Arc<dyn ObjectStore>,
    fallback: FallbackResolver,
}

impl JobProcessor {
    pub fn new(
        engine: CaptureEngine,
        objects: Arc<dyn ObjectStore>,
        fallback: FallbackResolver,
    ) -> Self {
        Self {
            engine,
            objects,
            fallback,
        }
    }

    /// Produces the job's successful result, or the error that should fail
    /// it. Storage errors are retryable; capture errors are final once the
    /// preview-image fallback has been tried.
    ///
    /// Once `cancel` fires the capture and fallback stop early with
    /// [`CaptureError::Abandoned`].
    pub async fn process(
        &self,
        job: &JobRecord,
        cancel: &CancellationToken,
    ) -> Result<ResultRecord> {
        let request = &job.payload;
        let key = StorageKey::for_request(request);

        // Another job id may have produced the same artifact meanwhile.
        if !request.fresh && self.objects.exists(&key).await? {
            debug!(job = %job.id, key = %key, "artifact already stored");
            return Ok(ResultRecord::done(
                self.objects.public_url(&key),
                0,
                0,
                0,
                ResultSource::Cache,
            ));
        }

        let image = match self.engine.capture(request, cancel).await {
            Ok(image) => image,
            Err(capture_err) => return self.recover(job, capture_err, cancel).await,
        };

        let (width, height, size) = (image.width, image.height, image.byte_size());
        let image_url = self
            .objects
            .put(&key, image.bytes, ARTIFACT_CONTENT_TYPE)
            .await?;

        info!(
            job = %job.id,
            key = %key,
            width,
            height,
            bytes = size,
            "capture stored"
        );
        Ok(ResultRecord::done(
            image_url,
            width,
            height,
            size,
            ResultSource::Capture,
        ))
    }

    async fn recover(
        &self,
        job: &JobRecord,
        capture_err: CaptureError,
        cancel: &CancellationToken,
    ) -> Result<ResultRecord> {
        if matches!(capture_err, CaptureError::Abandoned(_)) {
            return Err(capture_err);
        }
        if job.payload.no_og_fallback {
            warn!(job = %job.id, "capture failed, fallback disabled: {capture_err}");
            return Err(capture_err);
        }

        let Ok(page_url) = Url::parse(job.payload.url.trim()) else {
            return Err(capture_err);
        };

        let resolved = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CaptureError::Abandoned(job.payload.url.clone()));
            }
            resolved = self.fallback.resolve(&page_url) => resolved,
        };

        match resolved {
            Ok(image_url) => {
                warn!(
                    job = %job.id,
                    "capture failed, using preview image: {capture_err}"
                );
                Ok(ResultRecord::done(
                    image_url,
                    0,
                    0,
                    0,
                    ResultSource::PreviewImage,
                ))
            }
            Err(fallback_err) => {
                warn!(
                    job = %job.id,
                    "capture failed and no preview image available: \
                     {capture_err}; {fallback_err}"
                );
                Err(capture_err)
            }
        }
    }
}
