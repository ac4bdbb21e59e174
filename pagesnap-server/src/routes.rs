use std::path::PathBuf;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{
    handlers::{
        health,
        screenshot::{screenshot_status, submit_screenshot},
    },
    infra::app_state::AppState,
};

pub const SCREENSHOT: &str = "/api/screenshot";
pub const SCREENSHOT_STATUS: &str = "/api/screenshot/{job_id}";
pub const HEALTH: &str = "/healthz";
pub const ARTIFACTS: &str = "/artifacts";

/// Builds the HTTP surface. When `artifacts_root` is set the local object
/// store is served under [`ARTIFACTS`].
pub fn create_app(state: AppState, artifacts_root: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route(SCREENSHOT, post(submit_screenshot))
        .route(SCREENSHOT_STATUS, get(screenshot_status))
        .route(HEALTH, get(health))
        .with_state(state);

    if let Some(root) = artifacts_root {
        router = router.nest_service(ARTIFACTS, ServeDir::new(root));
    }

    router.layer(TraceLayer::new_for_http())
}
