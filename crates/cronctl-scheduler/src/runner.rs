use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use cronctl_core::{config::SchedulerConfig, CronctlError, Event, EventKey};
use cronctl_store::SharedStore;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::{
    internal::Supervisor,
    lock::{LockManager, TryClaim},
    registry::{ActionRegistry, EventContext},
};

/// Identifies an event the way the external runner does: by hashed action.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunRequest {
    pub timestamp: i64,
    /// md5 of the action name.
    pub action: String,
    pub instance: String,
}

/// What happened to an event that was run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub event: Event,
    /// Next occurrence scheduled for a recurring event.
    pub next: Option<Event>,
}

/// Runs a single event: validates, claims, executes and finalises it.
///
/// Expected refusals (premature, unknown, claimed elsewhere, busy, handler
/// failure) come back as benign [`CronctlError`] variants; only a failing
/// store is reported as `StoreUnavailable`.
pub struct EventRunner {
    store: SharedStore,
    registry: Arc<ActionRegistry>,
    supervisor: Arc<Supervisor>,
    locks: Arc<LockManager>,
    execution_buffer_secs: i64,
}

impl EventRunner {
    pub fn new(
        store: SharedStore,
        registry: Arc<ActionRegistry>,
        supervisor: Arc<Supervisor>,
        locks: Arc<LockManager>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            supervisor,
            locks,
            execution_buffer_secs: config.execution_buffer_secs,
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub async fn run(&self, request: &RunRequest, now: i64) -> Result<RunOutcome, CronctlError> {
        if request.action.is_empty() || request.instance.is_empty() {
            return Err(CronctlError::Validation(
                "action and instance are required".into(),
            ));
        }
        if request.timestamp > now + self.execution_buffer_secs {
            return Err(CronctlError::Validation(format!(
                "event {} is not due yet",
                request.timestamp
            )));
        }

        let event = self
            .store
            .find_by_hash(request.timestamp, &request.action, &request.instance)
            .map_err(CronctlError::from)?
            .ok_or_else(|| CronctlError::NotFound {
                key: format!(
                    "{}-{}-{}",
                    request.timestamp, request.action, request.instance
                ),
            })?;

        self.run_event(event.key(), now).await
    }

    /// Run the active event under `key`, bypassing the due-time check.
    pub async fn run_event(&self, key: EventKey, now: i64) -> Result<RunOutcome, CronctlError> {
        let handler = self.registry.get(&key.action).ok_or_else(|| {
            CronctlError::Validation(format!("no handler registered for `{}`", key.action))
        })?;

        // Internal events must keep running even when user handlers saturate
        // every slot.
        let slot = if self.supervisor.is_internal_event(&key.action) {
            None
        } else {
            match self.locks.try_acquire_slot() {
                Some(permit) => Some(permit),
                None => {
                    return Err(CronctlError::Busy(format!(
                        "no free slots, all {} in use",
                        self.locks.max_slots()
                    )))
                }
            }
        };

        let event = match self.locks.try_claim(&key, now)? {
            TryClaim::Claimed(event) => event,
            TryClaim::AlreadyClaimed => {
                return Err(CronctlError::AlreadyClaimed {
                    key: key.to_string(),
                })
            }
            TryClaim::NotFound => return Err(CronctlError::NotFound { key: key.to_string() }),
        };

        let ctx = EventContext {
            event: event.clone(),
            now,
        };
        let event_id = event.id;
        let locks = self.locks.clone();
        // Detached: a dropped caller must not leave the row `running`.
        let task = tokio::spawn(async move {
            let _slot = slot;
            let started = Instant::now();
            // A nested task turns a handler panic into a JoinError.
            let result = match tokio::spawn(async move { handler.run(ctx).await }).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(join) if join.is_panic() => {
                    Err(format!("handler panicked: {}", panic_message(join.into_panic())))
                }
                Err(join) => Err(format!("handler task cancelled: {join}")),
            };
            let finished_at = now + started.elapsed().as_secs() as i64;
            settle(&locks, key, event_id, result, finished_at)
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(join) => Err(CronctlError::Internal(format!("run task failed: {join}"))),
        }
    }
}

/// Record the handler's result on the claimed row.
fn settle(
    locks: &LockManager,
    key: EventKey,
    event_id: i64,
    result: Result<(), String>,
    finished_at: i64,
) -> Result<RunOutcome, CronctlError> {
    match result {
        Ok(()) => {
            let done = locks.complete(&key, finished_at)?;
            info!(event_id, action = %key.action, "event completed");
            Ok(RunOutcome {
                event: done.finished,
                next: done.next,
            })
        }
        Err(reason) => {
            warn!(event_id, action = %key.action, %reason, "event failed");
            if let Err(e) = locks.fail(&key, &reason, finished_at) {
                error!(event_id, "could not record failure: {e}");
                return Err(e.into());
            }
            Err(CronctlError::Handler {
                action: key.action,
                reason,
            })
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
