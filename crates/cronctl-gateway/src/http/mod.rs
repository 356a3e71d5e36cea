pub mod auth;
pub mod events;
pub mod health;
pub mod run;

use axum::{http::StatusCode, Json};
use cronctl_core::CronctlError;
use serde_json::{json, Value};

pub type ErrorResponse = (StatusCode, Json<Value>);

/// Catch-all for unknown paths and wrong methods on known ones.
pub async fn not_found() -> ErrorResponse {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
}

/// Runner-facing refusal: the request was understood but not honoured.
pub fn refusal(message: impl Into<String>) -> Json<Value> {
    Json(json!({"success": false, "message": message.into()}))
}

/// Map a non-benign error onto a request-level failure.
pub fn fault(err: &CronctlError) -> ErrorResponse {
    let status = match err {
        CronctlError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"error": err.to_string(), "code": err.code()})),
    )
}
