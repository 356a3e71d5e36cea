// Behaviour every EventStore backend must share.
// Each test body runs once per backend through `store_contract!`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cronctl_core::{hash::hash_action, EventKey, EventStatus, NewEvent, Recurrence};
use cronctl_store::{
    ClaimOutcome, EventStore, Page, RecordStore, SharedStore, StoreObserver, TableStore,
};
use rusqlite::Connection;
use serde_json::json;

const NOW: i64 = 1_700_000_000;

fn table() -> SharedStore {
    Arc::new(TableStore::new(Connection::open_in_memory().unwrap()).unwrap())
}

fn records() -> SharedStore {
    Arc::new(RecordStore::new(Connection::open_in_memory().unwrap()).unwrap())
}

fn claimed(outcome: ClaimOutcome) -> bool {
    matches!(outcome, ClaimOutcome::Claimed(_))
}

// --- contract bodies -------------------------------------------------------

fn create_dedupes_active_key(store: SharedStore) {
    let first = store
        .create(NewEvent::once(NOW, "publish_post", vec![json!(5)]))
        .unwrap();
    let second = store
        .create(NewEvent::once(NOW, "publish_post", vec![json!(5)]))
        .unwrap();

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(first.event().id, second.event().id);
    assert_eq!(store.count_by_status(EventStatus::Pending).unwrap(), 1);

    // Different args are a different instance.
    let other = store
        .create(NewEvent::once(NOW, "publish_post", vec![json!(6)]))
        .unwrap();
    assert!(other.is_created());
}

fn finished_key_can_be_scheduled_again(store: SharedStore) {
    let ev = NewEvent::recurring(NOW, "sync_feeds", vec![], Recurrence::new("hourly", 3600));
    let key = ev.key();
    store.create(ev.clone()).unwrap();
    store.fail(&key, "boom", NOW).unwrap();

    // The failed row stays but no longer blocks the key.
    let again = store.create(ev).unwrap();
    assert!(again.is_created());
    assert_eq!(store.count_by_status(EventStatus::Failed).unwrap(), 1);
}

fn due_events_respect_window_and_order(store: SharedStore) {
    for (offset, action) in [
        (1800, "e"),
        (-60, "a"),
        (0, "b"),
        (0, "c"),
        (300, "d"),
        (600, "f"),
    ] {
        store
            .create(NewEvent::once(NOW + offset, action, vec![]))
            .unwrap();
    }

    let due: Vec<_> = store
        .find_due(NOW, 0, 10)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(due, vec!["a", "b", "c"]);

    let ahead: Vec<_> = store
        .find_due(NOW, 600, 10)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(ahead, vec!["a", "b", "c", "d", "f"]);

    assert_eq!(store.find_due(NOW, 600, 2).unwrap().len(), 2);
}

fn due_for_actions_filters_by_name(store: SharedStore) {
    store.create(NewEvent::once(NOW - 5, "user_job", vec![])).unwrap();
    store.create(NewEvent::once(NOW - 1, "cronctl_purge", vec![])).unwrap();
    store.create(NewEvent::once(NOW + 999, "cronctl_purge", vec![json!(1)])).unwrap();

    let found = store
        .find_due_for_actions(NOW, 0, &["cronctl_purge".to_string()], 10)
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].action, "cronctl_purge");

    assert!(store.find_due_for_actions(NOW, 0, &[], 10).unwrap().is_empty());
}

fn only_one_claim_wins(store: SharedStore) {
    let created = store
        .create(NewEvent::once(NOW, "send_digest", vec![json!("weekly")]))
        .unwrap();
    let key = created.event().key();

    let wins = AtomicUsize::new(0);
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                if claimed(store.claim(&key, NOW, 300).unwrap()) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    let running = store.get(&key).unwrap().unwrap();
    assert_eq!(running.status, EventStatus::Running);
    assert_eq!(running.claimed_at, Some(NOW));
    assert_eq!(running.lease_expires_at, Some(NOW + 300));
}

fn claim_of_missing_event_is_already_claimed(store: SharedStore) {
    let key = EventKey::for_args(NOW, "nothing_here", &[]);
    assert!(!claimed(store.claim(&key, NOW, 300).unwrap()));
}

fn completing_one_shot_removes_it(store: SharedStore) {
    let key = store
        .create(NewEvent::once(NOW, "publish_post", vec![]))
        .unwrap()
        .event()
        .key();
    assert!(claimed(store.claim(&key, NOW, 300).unwrap()));

    let done = store.complete(&key, NOW + 2).unwrap();
    assert_eq!(done.finished.status, EventStatus::Completed);
    assert!(done.next.is_none());
    assert!(store.get(&key).unwrap().is_none());
    for status in EventStatus::ALL {
        assert_eq!(store.count_by_status(status).unwrap(), 0);
    }
}

fn completing_recurring_schedules_next(store: SharedStore) {
    let ev = NewEvent::recurring(
        NOW,
        "refresh_cache",
        vec![json!({"scope": "all"})],
        Recurrence::new("cronctl_ten_minutes", 600),
    );
    let key = ev.key();
    store.create(ev).unwrap();
    store.claim(&key, NOW, 300).unwrap();

    let done = store.complete(&key, NOW).unwrap();
    let next = done.next.expect("next occurrence");
    assert_eq!(next.timestamp, NOW + 600);
    assert_eq!(next.status, EventStatus::Pending);
    assert_eq!(next.instance, key.instance);
    assert_eq!(next.args, vec![json!({"scope": "all"})]);

    assert_eq!(store.count_by_status(EventStatus::Completed).unwrap(), 1);
    assert_eq!(store.count_by_status(EventStatus::Pending).unwrap(), 1);
    assert!(store.get(&key).unwrap().is_none());
}

fn late_recurring_run_keeps_cadence(store: SharedStore) {
    let ev = NewEvent::recurring(NOW, "tick", vec![], Recurrence::new("hourly", 3600));
    let key = ev.key();
    store.create(ev).unwrap();

    let done = store.complete(&key, NOW + 5000).unwrap();
    assert_eq!(done.next.unwrap().timestamp, NOW + 7200);
}

fn failure_is_recorded(store: SharedStore) {
    let key = store
        .create(NewEvent::once(NOW, "publish_post", vec![]))
        .unwrap()
        .event()
        .key();
    store.claim(&key, NOW, 300).unwrap();

    let done = store.fail(&key, "handler exploded", NOW + 1).unwrap();
    assert_eq!(done.finished.status, EventStatus::Failed);
    assert!(done.next.is_none());

    let failed = store.list(EventStatus::Failed, Page::default()).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].last_error.as_deref(), Some("handler exploded"));
    assert_eq!(failed[0].claimed_at, None);
    assert!(store.get(&key).unwrap().is_none());
}

fn finishing_unknown_key_is_not_found(store: SharedStore) {
    let key = EventKey::for_args(NOW, "ghost", &[]);
    assert!(matches!(
        store.complete(&key, NOW),
        Err(cronctl_store::StoreError::NotFound { .. })
    ));
}

fn expired_leases_are_reaped(store: SharedStore) {
    let short = store.create(NewEvent::once(NOW, "a", vec![])).unwrap().event().key();
    let long = store.create(NewEvent::once(NOW, "b", vec![])).unwrap().event().key();
    store.claim(&short, NOW, 10).unwrap();
    store.claim(&long, NOW, 1000).unwrap();

    assert_eq!(store.reap_expired_leases(NOW + 9).unwrap(), 0);
    assert_eq!(store.reap_expired_leases(NOW + 10).unwrap(), 1);

    let reverted = store.get(&short).unwrap().unwrap();
    assert_eq!(reverted.status, EventStatus::Pending);
    assert_eq!(reverted.claimed_at, None);
    assert_eq!(reverted.lease_expires_at, None);
    assert_eq!(store.get(&long).unwrap().unwrap().status, EventStatus::Running);

    // Reclaimable once reverted.
    assert!(claimed(store.claim(&short, NOW + 11, 10).unwrap()));
}

fn delete_removes_only_the_active_row(store: SharedStore) {
    let ev = NewEvent::recurring(NOW, "digest", vec![], Recurrence::new("daily", 86_400));
    let key = ev.key();
    store.create(ev.clone()).unwrap();
    store.fail(&key, "nope", NOW).unwrap();
    store.create(ev).unwrap();

    assert!(store.delete(&key).unwrap());
    assert!(!store.delete(&key).unwrap());
    assert_eq!(store.count_by_status(EventStatus::Failed).unwrap(), 1);
}

fn lookup_by_hashed_action(store: SharedStore) {
    let created = store
        .create(NewEvent::once(NOW, "publish_post", vec![json!(9)]))
        .unwrap();
    let instance = created.event().instance.clone();

    let found = store
        .find_by_hash(NOW, &hash_action("publish_post"), &instance)
        .unwrap()
        .unwrap();
    assert_eq!(found.action, "publish_post");
    assert_eq!(found.args, vec![json!(9)]);

    assert!(store
        .find_by_hash(NOW + 1, &hash_action("publish_post"), &instance)
        .unwrap()
        .is_none());
    assert!(store
        .find_by_hash(NOW, &hash_action("other"), &instance)
        .unwrap()
        .is_none());
}

fn next_scheduled_is_earliest_active(store: SharedStore) {
    store.create(NewEvent::once(NOW + 500, "backup", vec![json!(1)])).unwrap();
    store.create(NewEvent::once(NOW + 100, "backup", vec![json!(2)])).unwrap();
    store.create(NewEvent::once(NOW + 50, "unrelated", vec![])).unwrap();

    let next = store.next_scheduled("backup").unwrap().unwrap();
    assert_eq!(next.timestamp, NOW + 100);
    assert!(store.next_scheduled("missing").unwrap().is_none());
}

fn purge_drops_old_finished_rows(store: SharedStore) {
    for (ts, action) in [(NOW, "old"), (NOW + 1, "new")] {
        let key = store.create(NewEvent::once(ts, action, vec![])).unwrap().event().key();
        store.fail(&key, "x", ts).unwrap();
    }
    store.create(NewEvent::once(NOW - 10_000, "pending", vec![])).unwrap();

    assert_eq!(store.purge_finished(NOW).unwrap(), 1);
    assert_eq!(store.count_by_status(EventStatus::Failed).unwrap(), 1);
    assert_eq!(store.count_by_status(EventStatus::Pending).unwrap(), 1);
}

fn list_paginates_in_order(store: SharedStore) {
    for i in 0..5 {
        store.create(NewEvent::once(NOW + i, "job", vec![json!(i)])).unwrap();
    }
    let page2 = store.list(EventStatus::Pending, Page::new(2, 2)).unwrap();
    let stamps: Vec<_> = page2.iter().map(|e| e.timestamp).collect();
    assert_eq!(stamps, vec![NOW + 2, NOW + 3]);
    assert!(store.list(EventStatus::Pending, Page::new(4, 2)).unwrap().is_empty());
}

macro_rules! store_contract {
    ($($name:ident),* $(,)?) => {
        mod table_backend {
            use super::*;
            $( #[test] fn $name() { super::$name(table()); } )*
        }
        mod records_backend {
            use super::*;
            $( #[test] fn $name() { super::$name(records()); } )*
        }
    };
}

store_contract!(
    create_dedupes_active_key,
    finished_key_can_be_scheduled_again,
    due_events_respect_window_and_order,
    due_for_actions_filters_by_name,
    only_one_claim_wins,
    claim_of_missing_event_is_already_claimed,
    completing_one_shot_removes_it,
    completing_recurring_schedules_next,
    late_recurring_run_keeps_cadence,
    failure_is_recorded,
    finishing_unknown_key_is_not_found,
    expired_leases_are_reaped,
    delete_removes_only_the_active_row,
    lookup_by_hashed_action,
    next_scheduled_is_earliest_active,
    purge_drops_old_finished_rows,
    list_paginates_in_order,
);

// --- backend-specific ------------------------------------------------------

#[derive(Default)]
struct CountingObserver(AtomicUsize);

impl StoreObserver for CountingObserver {
    fn on_mutation(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn observer_sees_mutations_but_not_reads() {
    let observer = Arc::new(CountingObserver::default());
    let store = cronctl_store::open_observed(
        cronctl_core::config::StoreBackend::Table,
        Connection::open_in_memory().unwrap(),
        observer.clone(),
    )
    .unwrap();

    let key = store.create(NewEvent::once(NOW, "a", vec![])).unwrap().event().key();
    store.create(NewEvent::once(NOW, "a", vec![])).unwrap();
    store.find_due(NOW, 0, 10).unwrap();
    store.get(&key).unwrap();
    assert_eq!(observer.0.load(Ordering::SeqCst), 1);

    store.claim(&key, NOW, 60).unwrap();
    store.complete(&key, NOW).unwrap();
    assert_eq!(observer.0.load(Ordering::SeqCst), 3);
}

#[test]
fn two_connections_share_one_claim() {
    let path = std::env::temp_dir().join(format!("cronctl-{}.db", uuid::Uuid::new_v4()));
    let open = || {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("PRAGMA journal_mode=WAL;").unwrap();
        TableStore::new(conn).unwrap()
    };
    let a = open();
    let b = open();

    let key = a
        .create(NewEvent::once(NOW, "publish_post", vec![]))
        .unwrap()
        .event()
        .key();
    assert!(!b.create(NewEvent::once(NOW, "publish_post", vec![])).unwrap().is_created());

    let first = claimed(a.claim(&key, NOW, 300).unwrap());
    let second = claimed(b.claim(&key, NOW, 300).unwrap());
    assert!(first && !second);

    drop(a);
    drop(b);
    let _ = std::fs::remove_file(&path);
}
