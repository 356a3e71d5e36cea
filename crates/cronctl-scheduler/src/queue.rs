use std::sync::Arc;

use cronctl_core::{config::SchedulerConfig, Event};
use cronctl_store::SharedStore;
use serde::Serialize;
use tracing::debug;

use crate::{error::Result, internal::Supervisor, registry::ActionRegistry};

/// Events offered to the external runner by one list call.
#[derive(Debug, Clone, Serialize)]
pub struct DueEvents {
    pub events: Vec<Event>,
    /// How many of `events` are internal housekeeping events.
    pub internal_count: usize,
    pub window_seconds: i64,
    pub now: i64,
}

/// Selects the events that are due and runnable.
pub struct DueQueue {
    store: SharedStore,
    registry: Arc<ActionRegistry>,
    supervisor: Arc<Supervisor>,
    queue_size: usize,
    window_secs: i64,
}

impl DueQueue {
    pub fn new(
        store: SharedStore,
        registry: Arc<ActionRegistry>,
        supervisor: Arc<Supervisor>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            supervisor,
            queue_size: config.queue_size,
            window_secs: config.queue_window_secs,
        }
    }

    /// Pending events with `timestamp <= now + window`, oldest first.
    ///
    /// Without `max_events`, up to `queue_size` user events are returned and
    /// every due internal event comes on top of that. An explicit
    /// `max_events` caps user events and then truncates the merged list.
    /// Events with no registered handler are skipped and left in the store.
    pub fn get_events(
        &self,
        now: i64,
        max_events: Option<usize>,
        window_seconds: Option<i64>,
    ) -> Result<DueEvents> {
        let window = window_seconds.unwrap_or(self.window_secs).max(0);
        let user_cap = max_events.unwrap_or(self.queue_size);

        let internal: Vec<Event> = self
            .store
            .find_due_for_actions(now, window, &self.supervisor.internal_actions(), usize::MAX)?
            .into_iter()
            .filter(|e| self.registry.contains(&e.action))
            .collect();

        let mut events = self.user_events(now, window, user_cap)?;
        events.extend(internal);
        // Stable: equal timestamps keep creation order.
        events.sort_by_key(|e| (e.timestamp, e.id));
        if let Some(max) = max_events {
            events.truncate(max);
        }

        let internal_count = events
            .iter()
            .filter(|e| self.supervisor.is_internal_event(&e.action))
            .count();
        debug!(
            count = events.len(),
            internal_count, window, "due events selected"
        );

        Ok(DueEvents {
            events,
            internal_count,
            window_seconds: window,
            now,
        })
    }

    /// Up to `cap` runnable user events. Doubles the fetch size until the
    /// cap is met or the store runs dry, so unregistered rows at the head of
    /// the queue cannot starve the rest.
    fn user_events(&self, now: i64, window: i64, cap: usize) -> Result<Vec<Event>> {
        if cap == 0 {
            return Ok(Vec::new());
        }

        let mut fetch = cap;
        loop {
            let batch = self.store.find_due(now, window, fetch)?;
            let exhausted = batch.len() < fetch;
            let runnable: Vec<Event> = batch
                .into_iter()
                .filter(|e| !self.supervisor.is_internal_event(&e.action))
                .filter(|e| self.registry.contains(&e.action))
                .take(cap)
                .collect();

            if runnable.len() >= cap || exhausted {
                return Ok(runnable);
            }
            fetch = fetch.saturating_mul(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::REAP_EXPIRED_LEASES;
    use crate::registry::handler_fn;
    use cronctl_core::{config::CronctlConfig, NewEvent};
    use cronctl_store::TableStore;
    use rusqlite::Connection;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        store: SharedStore,
        registry: Arc<ActionRegistry>,
        supervisor: Arc<Supervisor>,
        queue: DueQueue,
    }

    fn fixture(queue_size: usize) -> Fixture {
        let store: SharedStore =
            Arc::new(TableStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let registry = Arc::new(ActionRegistry::new());
        registry.register("job", handler_fn(|_| async { Ok(()) }));

        let mut config = CronctlConfig::default();
        config.scheduler.queue_size = queue_size;
        let supervisor =
            Arc::new(Supervisor::new(store.clone(), &registry, None, &config).unwrap());
        let queue = DueQueue::new(
            store.clone(),
            registry.clone(),
            supervisor.clone(),
            &config.scheduler,
        );
        Fixture {
            store,
            registry,
            supervisor,
            queue,
        }
    }

    fn add(store: &SharedStore, ts: i64, action: &str, n: i64) {
        store
            .create(NewEvent::once(ts, action, vec![n.into()]))
            .unwrap();
    }

    #[test]
    fn window_bounds_selection() {
        let f = fixture(10);
        for (i, offset) in [-60, 0, 0, 300, 600, 1800].into_iter().enumerate() {
            add(&f.store, NOW + offset, "job", i as i64);
        }

        let due = f.queue.get_events(NOW, None, Some(0)).unwrap();
        assert_eq!(due.events.len(), 3);
        assert_eq!(due.window_seconds, 0);

        let due = f.queue.get_events(NOW, None, Some(600)).unwrap();
        let stamps: Vec<_> = due.events.iter().map(|e| e.timestamp - NOW).collect();
        assert_eq!(stamps, vec![-60, 0, 0, 300, 600]);
    }

    #[test]
    fn default_window_takes_events_due_now() {
        let f = fixture(10);
        for (i, offset) in [-60, 0, 0, 300, 600, 1800].into_iter().enumerate() {
            add(&f.store, NOW + offset, "job", i as i64);
        }

        let due = f.queue.get_events(NOW, None, None).unwrap();
        assert_eq!(due.window_seconds, 30);
        let stamps: Vec<_> = due.events.iter().map(|e| e.timestamp - NOW).collect();
        assert_eq!(stamps, vec![-60, 0, 0]);
    }

    #[test]
    fn wide_window_and_single_event_cap() {
        let f = fixture(10);
        for (i, offset) in [-60, 0, 0, 300, 600, 1800].into_iter().enumerate() {
            add(&f.store, NOW + offset, "job", i as i64);
        }

        let due = f.queue.get_events(NOW, None, Some(660)).unwrap();
        assert_eq!(due.events.len(), 5);
        assert!(due.events.iter().all(|e| e.timestamp <= NOW + 600));

        let due = f.queue.get_events(NOW, Some(1), None).unwrap();
        assert_eq!(due.events.len(), 1);
        assert_eq!(due.events[0].timestamp, NOW - 60);
    }

    #[test]
    fn ties_keep_creation_order() {
        let f = fixture(10);
        for n in 0..4 {
            add(&f.store, NOW, "job", n);
        }
        let due = f.queue.get_events(NOW, None, None).unwrap();
        let args: Vec<_> = due.events.iter().map(|e| e.args[0].clone()).collect();
        assert_eq!(args, vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn unregistered_actions_are_skipped_not_starving() {
        let f = fixture(3);
        for n in 0..10 {
            add(&f.store, NOW - 100 + n, "nobody_handles_this", n);
        }
        for n in 0..5 {
            add(&f.store, NOW, "job", n);
        }

        let due = f.queue.get_events(NOW, None, None).unwrap();
        assert_eq!(due.events.len(), 3);
        assert!(due.events.iter().all(|e| e.action == "job"));
        assert_eq!(
            f.store
                .count_by_status(cronctl_core::EventStatus::Pending)
                .unwrap(),
            15
        );
    }

    #[test]
    fn internal_events_get_reserved_capacity() {
        let f = fixture(2);
        for n in 0..5 {
            add(&f.store, NOW - 10, "job", n);
        }
        f.supervisor.ensure_scheduled(NOW - 40).unwrap();

        let due = f.queue.get_events(NOW, None, None).unwrap();
        assert_eq!(due.internal_count, 3);
        assert_eq!(due.events.len(), 5);
        assert!(due
            .events
            .iter()
            .any(|e| e.action == REAP_EXPIRED_LEASES));
    }

    #[test]
    fn explicit_max_truncates_merged_list() {
        let f = fixture(10);
        for n in 0..5 {
            add(&f.store, NOW - 100, "job", n);
        }
        f.supervisor.ensure_scheduled(NOW - 40).unwrap();

        let due = f.queue.get_events(NOW, Some(4), None).unwrap();
        assert_eq!(due.events.len(), 4);
        // Internal events sit at NOW - 10, after the user events.
        assert_eq!(due.internal_count, 0);
    }

    #[test]
    fn registry_changes_take_effect_immediately() {
        let f = fixture(10);
        add(&f.store, NOW, "late_bound", 1);
        assert!(f.queue.get_events(NOW, None, None).unwrap().events.is_empty());

        f.registry
            .register("late_bound", handler_fn(|_| async { Ok(()) }));
        assert_eq!(f.queue.get_events(NOW, None, None).unwrap().events.len(), 1);
    }
}
