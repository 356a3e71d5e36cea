use std::sync::Arc;

use async_trait::async_trait;
use cronctl_cache::Bucketizer;
use cronctl_core::{config::CronctlConfig, NewEvent, Recurrence};
use cronctl_store::SharedStore;
use tracing::{debug, info};

use crate::{
    error::{Result, SchedulerError},
    registry::{ActionRegistry, EventContext, EventHandler},
    schedules::{self, MINUTE, TEN_MINUTES},
};

pub const REAP_EXPIRED_LEASES: &str = "cronctl_reap_expired_leases";
pub const PURGE_FINISHED_EVENTS: &str = "cronctl_purge_finished_events";
pub const FLUSH_CACHED_VIEW: &str = "cronctl_flush_cached_view";

/// A housekeeping event the supervisor keeps scheduled at all times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalEvent {
    pub action: String,
    pub schedule: Recurrence,
}

/// Keeps the engine's own recurring events alive.
///
/// Built-ins plus any `[[internal_events]]` from config. Their actions are
/// reserved: the due queue gives them capacity on top of the user cap, run
/// slots do not apply to them, and legacy writes never delete them.
pub struct Supervisor {
    store: SharedStore,
    events: Vec<InternalEvent>,
    first_run_delay: i64,
}

impl Supervisor {
    /// Register built-in handlers and bind configured extras.
    ///
    /// Each configured `callback` must already be registered; its handler is
    /// bound under the configured `action` as well.
    pub fn new(
        store: SharedStore,
        registry: &ActionRegistry,
        view: Option<Arc<Bucketizer>>,
        config: &CronctlConfig,
    ) -> Result<Self> {
        let mut events = vec![
            InternalEvent {
                action: REAP_EXPIRED_LEASES.to_string(),
                schedule: schedules::recurrence(MINUTE)?,
            },
            InternalEvent {
                action: PURGE_FINISHED_EVENTS.to_string(),
                schedule: schedules::recurrence(TEN_MINUTES)?,
            },
            InternalEvent {
                action: FLUSH_CACHED_VIEW.to_string(),
                schedule: schedules::recurrence("daily")?,
            },
        ];
        registry.register(
            REAP_EXPIRED_LEASES,
            Arc::new(ReapExpiredLeases {
                store: store.clone(),
            }),
        );
        registry.register(
            PURGE_FINISHED_EVENTS,
            Arc::new(PurgeFinishedEvents {
                store: store.clone(),
                retention_secs: config.scheduler.retention_secs,
            }),
        );
        registry.register(FLUSH_CACHED_VIEW, Arc::new(FlushCachedView { view }));

        for extra in &config.internal_events {
            let handler = registry.get(&extra.callback).ok_or_else(|| {
                SchedulerError::UnknownCallback {
                    action: extra.action.clone(),
                    callback: extra.callback.clone(),
                }
            })?;
            let schedule = schedules::recurrence(&extra.schedule)?;
            if extra.action != extra.callback {
                registry.register(extra.action.clone(), handler);
            }
            events.retain(|e| e.action != extra.action);
            events.push(InternalEvent {
                action: extra.action.clone(),
                schedule,
            });
        }

        Ok(Self {
            store,
            events,
            first_run_delay: config.scheduler.queue_window_secs,
        })
    }

    pub fn events(&self) -> &[InternalEvent] {
        &self.events
    }

    pub fn is_internal_event(&self, action: &str) -> bool {
        self.events.iter().any(|e| e.action == action)
    }

    pub fn internal_actions(&self) -> Vec<String> {
        self.events.iter().map(|e| e.action.clone()).collect()
    }

    /// Schedule every internal event that has no active occurrence.
    /// Returns how many were created.
    pub fn ensure_scheduled(&self, now: i64) -> Result<usize> {
        let mut created = 0;
        for internal in &self.events {
            if self.store.next_scheduled(&internal.action)?.is_some() {
                continue;
            }
            let event = NewEvent::recurring(
                now + self.first_run_delay,
                internal.action.clone(),
                Vec::new(),
                internal.schedule.clone(),
            );
            if self.store.create(event)?.is_created() {
                info!(action = %internal.action, "internal event scheduled");
                created += 1;
            }
        }
        Ok(created)
    }
}

// --- built-in handlers -----------------------------------------------------

struct ReapExpiredLeases {
    store: SharedStore,
}

#[async_trait]
impl EventHandler for ReapExpiredLeases {
    async fn run(&self, ctx: EventContext) -> anyhow::Result<()> {
        let reaped = self.store.reap_expired_leases(ctx.now)?;
        debug!(reaped, "lease reaper ran");
        Ok(())
    }
}

struct PurgeFinishedEvents {
    store: SharedStore,
    retention_secs: i64,
}

#[async_trait]
impl EventHandler for PurgeFinishedEvents {
    async fn run(&self, ctx: EventContext) -> anyhow::Result<()> {
        let purged = self
            .store
            .purge_finished(ctx.now - self.retention_secs)?;
        debug!(purged, "finished-event purge ran");
        Ok(())
    }
}

struct FlushCachedView {
    view: Option<Arc<Bucketizer>>,
}

#[async_trait]
impl EventHandler for FlushCachedView {
    async fn run(&self, _ctx: EventContext) -> anyhow::Result<()> {
        if let Some(view) = &self.view {
            view.invalidate();
        }
        Ok(())
    }
}
