use std::sync::Arc;

use cronctl_core::{Event, EventKey, EventStatus, NewEvent};

use crate::error::Result;

/// Result of a schedule request.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A new row was written.
    Created(Event),
    /// An active row with the same key already exists; nothing was written.
    AlreadyExists(Event),
}

impl CreateOutcome {
    pub fn event(&self) -> &Event {
        match self {
            CreateOutcome::Created(e) | CreateOutcome::AlreadyExists(e) => e,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Result of the conditional `pending -> running` transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller now owns the event until the lease expires.
    Claimed(Event),
    /// Zero rows matched: someone else holds it, or it no longer exists.
    AlreadyClaimed,
}

/// Result of a terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The event as it was when finished.
    pub finished: Event,
    /// Next occurrence created for a recurring event.
    pub next: Option<Event>,
}

/// 1-based pagination for listing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: usize,
    pub per_page: usize,
}

impl Page {
    pub fn new(page: usize, per_page: usize) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.max(1),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page - 1) * self.per_page
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 100)
    }
}

/// Told about every successful mutation, so derived views can be dropped.
pub trait StoreObserver: Send + Sync {
    fn on_mutation(&self);
}

/// Durable storage for scheduled events.
///
/// Every implementation honours the same contract:
///
/// - `(timestamp, action, instance)` is unique among pending and running rows;
///   `create` on an active key returns [`CreateOutcome::AlreadyExists`].
/// - `claim` is one conditional update; losing the race is
///   [`ClaimOutcome::AlreadyClaimed`], never an error.
/// - `complete` deletes one-shot events; recurring events are marked
///   completed and their next occurrence is created. `fail` keeps the row
///   as failed and also re-arms recurring events.
/// - Due and listing queries order by timestamp, then creation sequence.
pub trait EventStore: Send + Sync {
    /// Short identifier used in logs.
    fn backend(&self) -> &'static str;

    fn create(&self, event: NewEvent) -> Result<CreateOutcome>;

    /// The active (pending or running) event stored under `key`.
    fn get(&self, key: &EventKey) -> Result<Option<Event>>;

    /// The active event whose md5'd action matches `action_hash`.
    fn find_by_hash(
        &self,
        timestamp: i64,
        action_hash: &str,
        instance: &str,
    ) -> Result<Option<Event>>;

    /// Pending events with `timestamp <= now + window`, oldest first.
    fn find_due(&self, now: i64, window: i64, limit: usize) -> Result<Vec<Event>>;

    /// As [`find_due`](Self::find_due), restricted to `actions`.
    fn find_due_for_actions(
        &self,
        now: i64,
        window: i64,
        actions: &[String],
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// Earliest active event for `action`, whatever its arguments.
    fn next_scheduled(&self, action: &str) -> Result<Option<Event>>;

    fn list(&self, status: EventStatus, page: Page) -> Result<Vec<Event>>;

    fn count_by_status(&self, status: EventStatus) -> Result<usize>;

    /// Atomically move `key` from pending to running with a lease of
    /// `lease_secs` starting at `now`.
    fn claim(&self, key: &EventKey, now: i64, lease_secs: i64) -> Result<ClaimOutcome>;

    fn complete(&self, key: &EventKey, now: i64) -> Result<Completion>;

    fn fail(&self, key: &EventKey, reason: &str, now: i64) -> Result<Completion>;

    /// Remove the active event under `key`. Returns whether a row was removed.
    fn delete(&self, key: &EventKey) -> Result<bool>;

    /// Revert running events whose lease ended at or before `now`.
    fn reap_expired_leases(&self, now: i64) -> Result<usize>;

    /// Drop completed and failed rows finished at or before `older_than`.
    fn purge_finished(&self, older_than: i64) -> Result<usize>;
}

pub type SharedStore = Arc<dyn EventStore>;

/// Clamp a `usize` limit into SQLite's signed integer range.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Current wall-clock time, RFC 3339, for the audit columns.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
