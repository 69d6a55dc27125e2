//! Health check.

use axum::Json;
use serde_json::json;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "azgate",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
