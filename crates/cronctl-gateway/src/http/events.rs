//! List endpoint: POST /cron-control/v1/events.
//!
//! The external runner polls this for due events, then PUTs each one back
//! to the run endpoint it advertises.

use axum::{body::Bytes, extract::State, Json};
use cronctl_core::{hash::hash_action, CronctlError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::http::{auth::verify_secret, fault, refusal, ErrorResponse};

#[derive(Debug, Default, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub secret: Option<String>,
}

/// POST /cron-control/v1/events
///
/// Re-arms internal events, then returns the due queue with action names
/// hashed. A bad secret is a 200 with `success: false`; a failing store is
/// a 503.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ErrorResponse> {
    let request: ListRequest = serde_json::from_slice(&body).unwrap_or_default();
    if let Err(reason) = verify_secret(
        state.config.gateway.secret.as_deref(),
        request.secret.as_deref(),
    ) {
        warn!(reason, "event list refused");
        return Ok(refusal(reason));
    }

    let now = chrono::Utc::now().timestamp();
    state
        .supervisor
        .ensure_scheduled(now)
        .map_err(|e| fault(&CronctlError::from(e)))?;
    let due = state
        .queue
        .get_events(now, None, None)
        .map_err(|e| fault(&CronctlError::from(e)))?;

    debug!(
        count = due.events.len(),
        internal = due.internal_count,
        "serving due events"
    );

    let events: Vec<Value> = due
        .events
        .iter()
        .map(|e| {
            json!({
                "timestamp": e.timestamp,
                "action": hash_action(&e.action),
                "instance": e.instance,
            })
        })
        .collect();

    Ok(Json(json!({
        "events": events,
        "endpoint": state.config.gateway.run_url(),
    })))
}
