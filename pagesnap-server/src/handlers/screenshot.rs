use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::debug;

use pagesnap_core::{CaptureRequest, JobStatus, SubmitOutcome, queue::JobId};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// `POST /api/screenshot`
pub async fn submit_screenshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CaptureRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(request) = payload?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::bad_request("Idempotency-Key must be visible ASCII"))
        })
        .transpose()?;

    match state.intake.submit(request, idempotency_key).await? {
        SubmitOutcome::CacheHit(hit) => Ok((StatusCode::OK, Json(hit)).into_response()),
        SubmitOutcome::Enqueued { job_id, accepted } => {
            debug!(job = %job_id, accepted, "screenshot accepted");
            let body = json!({
                "jobId": job_id,
                "statusUrl": state.status_url(&job_id),
            });
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
    }
}

/// `GET /api/screenshot/{job_id}`
pub async fn screenshot_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Response> {
    let status = state.status.poll(&JobId::new(job_id)).await?;
    let code = match status {
        JobStatus::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    Ok((code, Json(status)).into_response())
}
