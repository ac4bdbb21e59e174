pub mod screenshot;

use axum::Json;
use serde_json::{Value, json};

/// Liveness only; touches no backend.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
