//! Run endpoint: PUT /cron-control/v1/event.

use axum::{body::Bytes, extract::State, Json};
use cronctl_scheduler::RunRequest;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::http::{auth::verify_secret, fault, refusal, ErrorResponse};

#[derive(Debug, Default, Deserialize)]
pub struct RunBody {
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

impl RunBody {
    fn into_request(self) -> Option<RunRequest> {
        Some(RunRequest {
            timestamp: self.timestamp?,
            action: self.action.filter(|a| !a.is_empty())?,
            instance: self.instance.filter(|i| !i.is_empty())?,
        })
    }
}

/// PUT /cron-control/v1/event
///
/// Expected refusals (bad secret, premature, unknown, already claimed,
/// busy, handler failure) are a 200 with `success: false`. Only a failing
/// store surfaces as 503.
pub async fn run_event(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ErrorResponse> {
    let body: RunBody = serde_json::from_slice(&body).unwrap_or_default();
    if let Err(reason) = verify_secret(
        state.config.gateway.secret.as_deref(),
        body.secret.as_deref(),
    ) {
        warn!(reason, "event run refused");
        return Ok(refusal(reason));
    }

    let Some(request) = body.into_request() else {
        return Ok(refusal("timestamp, action and instance are required"));
    };

    let now = chrono::Utc::now().timestamp();
    match state.runner.run(&request, now).await {
        Ok(outcome) => {
            let message = match &outcome.next {
                Some(next) => format!(
                    "Executed `{}`; next run at {}",
                    outcome.event.action, next.timestamp
                ),
                None => format!("Executed `{}`", outcome.event.action),
            };
            Ok(Json(json!({"success": true, "message": message})))
        }
        Err(e) if e.is_benign() => {
            info!(code = e.code(), timestamp = request.timestamp, "run declined: {e}");
            Ok(refusal(e.to_string()))
        }
        Err(e) => {
            warn!(code = e.code(), "run failed: {e}");
            Err(fault(&e))
        }
    }
}
