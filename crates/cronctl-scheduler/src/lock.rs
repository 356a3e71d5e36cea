use std::sync::Arc;

use cronctl_core::{config::SchedulerConfig, Event, EventKey};
use cronctl_store::{ClaimOutcome, Completion, SharedStore};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::Result;

/// Outcome of a claim attempt. Only `Claimed` lets the caller run the event.
#[derive(Debug, Clone, PartialEq)]
pub enum TryClaim {
    Claimed(Event),
    /// Another executor holds it.
    AlreadyClaimed,
    /// No active event under that key.
    NotFound,
}

/// Mutual exclusion for event execution.
///
/// Claims are leases on the store row, so they hold across processes and
/// recover on their own once the lease lapses. Run slots are a per-process
/// cap on concurrent user-event handlers.
pub struct LockManager {
    store: SharedStore,
    lease_secs: i64,
    slots: Arc<Semaphore>,
    max_slots: usize,
}

impl LockManager {
    pub fn new(store: SharedStore, config: &SchedulerConfig) -> Self {
        Self {
            store,
            lease_secs: config.lease_secs,
            slots: Arc::new(Semaphore::new(config.max_concurrent_runs)),
            max_slots: config.max_concurrent_runs,
        }
    }

    pub fn lease_secs(&self) -> i64 {
        self.lease_secs
    }

    pub fn try_claim(&self, key: &EventKey, now: i64) -> Result<TryClaim> {
        match self.store.claim(key, now, self.lease_secs)? {
            ClaimOutcome::Claimed(event) => Ok(TryClaim::Claimed(event)),
            // Zero rows: tell a lost race apart from a missing row.
            ClaimOutcome::AlreadyClaimed => match self.store.get(key)? {
                Some(_) => {
                    debug!(%key, "claim lost");
                    Ok(TryClaim::AlreadyClaimed)
                }
                None => Ok(TryClaim::NotFound),
            },
        }
    }

    pub fn complete(&self, key: &EventKey, now: i64) -> Result<Completion> {
        Ok(self.store.complete(key, now)?)
    }

    pub fn fail(&self, key: &EventKey, reason: &str, now: i64) -> Result<Completion> {
        Ok(self.store.fail(key, reason, now)?)
    }

    /// Release claims whose lease has lapsed.
    pub fn reap(&self, now: i64) -> Result<usize> {
        Ok(self.store.reap_expired_leases(now)?)
    }

    /// Take a run slot if one is free. The slot is released on drop.
    pub fn try_acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronctl_core::NewEvent;
    use cronctl_store::TableStore;
    use rusqlite::Connection;

    fn manager(max_concurrent_runs: usize) -> (SharedStore, LockManager) {
        let store: SharedStore =
            Arc::new(TableStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let config = SchedulerConfig {
            max_concurrent_runs,
            lease_secs: 120,
            ..SchedulerConfig::default()
        };
        (store.clone(), LockManager::new(store, &config))
    }

    #[test]
    fn claim_outcomes_are_distinguished() {
        let (store, locks) = manager(2);
        let key = store
            .create(NewEvent::once(100, "job", vec![]))
            .unwrap()
            .event()
            .key();

        let TryClaim::Claimed(event) = locks.try_claim(&key, 100).unwrap() else {
            panic!("first claim should win");
        };
        assert_eq!(event.lease_expires_at, Some(220));
        assert_eq!(locks.try_claim(&key, 100).unwrap(), TryClaim::AlreadyClaimed);

        let missing = EventKey::for_args(100, "nope", &[]);
        assert_eq!(locks.try_claim(&missing, 100).unwrap(), TryClaim::NotFound);
    }

    #[test]
    fn completed_event_is_not_found() {
        let (store, locks) = manager(2);
        let key = store
            .create(NewEvent::once(100, "job", vec![]))
            .unwrap()
            .event()
            .key();
        locks.try_claim(&key, 100).unwrap();
        locks.complete(&key, 101).unwrap();
        assert_eq!(locks.try_claim(&key, 102).unwrap(), TryClaim::NotFound);
    }

    #[test]
    fn reap_makes_event_claimable_again() {
        let (store, locks) = manager(2);
        let key = store
            .create(NewEvent::once(100, "job", vec![]))
            .unwrap()
            .event()
            .key();
        locks.try_claim(&key, 100).unwrap();
        assert_eq!(locks.reap(219).unwrap(), 0);
        assert_eq!(locks.reap(220).unwrap(), 1);
        assert!(matches!(locks.try_claim(&key, 221).unwrap(), TryClaim::Claimed(_)));
    }

    #[test]
    fn slots_are_bounded_and_released_on_drop() {
        let (_, locks) = manager(2);
        let a = locks.try_acquire_slot().unwrap();
        let _b = locks.try_acquire_slot().unwrap();
        assert!(locks.try_acquire_slot().is_none());
        drop(a);
        assert_eq!(locks.available_slots(), 1);
        assert!(locks.try_acquire_slot().is_some());
    }
}
