use axum::{extract::State, Json};
use cronctl_core::{CronctlError, EventStatus};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;
use crate::http::{fault, ErrorResponse};

/// GET /health: liveness probe with store and cache status.
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ErrorResponse> {
    let pending = state
        .store
        .count_by_status(EventStatus::Pending)
        .map_err(|e| fault(&CronctlError::from(e)))?;
    let running = state
        .store
        .count_by_status(EventStatus::Running)
        .map_err(|e| fault(&CronctlError::from(e)))?;

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("CRONCTL_GIT_SHA"),
        "backend": state.store.backend(),
        "pending": pending,
        "running": running,
        "cached_view": state.view.metadata().is_some(),
        "actions": state.registry.actions(),
    })))
}
