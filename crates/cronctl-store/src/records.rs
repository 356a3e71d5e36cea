use std::sync::{Arc, Mutex, MutexGuard};

use cronctl_core::{
    hash::hash_action, Event, EventKey, EventStatus, NewEvent, Recurrence,
};
use rusqlite::{
    params, params_from_iter,
    types::{Type, Value as SqlValue},
    Connection, OptionalExtension, Row, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::{
    db::create_content_records_table,
    error::{Result, StoreError},
    store::{
        now_rfc3339, sql_limit, ClaimOutcome, Completion, CreateOutcome, EventStore, Page,
        StoreObserver,
    },
};

/// `record_type` of every row this store owns.
pub const RECORD_TYPE: &str = "cron_event";

const COLUMNS: &str = "id, sort_key, status, payload, lease_until, created_at, updated_at";

/// Event fields with no dedicated column on a content record.
#[derive(Debug, Serialize, Deserialize)]
struct EventPayload {
    action: String,
    action_hashed: String,
    instance: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    schedule: Option<Recurrence>,
    #[serde(default)]
    claimed_at: Option<i64>,
    #[serde(default)]
    last_error: Option<String>,
}

/// Event store layered on the generic `content_records` table.
///
/// An event is a record of type `cron_event`:
///
/// | Event field        | Record field                            |
/// |--------------------|-----------------------------------------|
/// | timestamp          | `sort_key`                              |
/// | status             | `status`                                |
/// | lease_expires_at   | `lease_until`                           |
/// | key                | `slug` = `{timestamp}-{md5(action)}-{instance}` |
/// | everything else    | `payload` JSON                          |
///
/// The table has no uniqueness constraint of its own, so `create` checks for
/// an active slug inside an immediate transaction.
pub struct RecordStore {
    conn: Mutex<Connection>,
    observer: Option<Arc<dyn StoreObserver>>,
}

impl RecordStore {
    pub fn new(conn: Connection) -> Result<Self> {
        create_content_records_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn StoreObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer.on_mutation();
        }
    }

    fn finish(&self, key: &EventKey, now: i64, failure: Option<&str>) -> Result<Completion> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut event = select_active(&tx, &slug_for(key))?.ok_or_else(|| {
            StoreError::NotFound {
                key: key.to_string(),
            }
        })?;
        let updated_at = now_rfc3339();

        match failure {
            Some(reason) => {
                tx.execute(
                    "UPDATE content_records
                     SET status = 'failed', lease_until = NULL, finished_at = ?1, updated_at = ?2,
                         payload = json_set(payload, '$.claimed_at', NULL, '$.last_error', ?3)
                     WHERE id = ?4",
                    params![now, updated_at, reason, event.id],
                )?;
                event.status = EventStatus::Failed;
                event.last_error = Some(reason.to_string());
            }
            None if !event.is_recurring() => {
                tx.execute("DELETE FROM content_records WHERE id = ?1", [event.id])?;
                event.status = EventStatus::Completed;
            }
            None => {
                tx.execute(
                    "UPDATE content_records
                     SET status = 'completed', lease_until = NULL, finished_at = ?1, updated_at = ?2,
                         payload = json_set(payload, '$.claimed_at', NULL)
                     WHERE id = ?3",
                    params![now, updated_at, event.id],
                )?;
                event.status = EventStatus::Completed;
            }
        }
        event.claimed_at = None;
        event.lease_expires_at = None;
        event.updated_at = updated_at;

        let next = match NewEvent::next_occurrence(&event, now) {
            Some(next) => {
                let slug = slug_for(&next.key());
                match select_active(&tx, &slug)? {
                    Some(existing) => Some(existing),
                    None => {
                        let id = insert_record(&tx, &next, &slug)?;
                        Some(select_by_id(&tx, id)?)
                    }
                }
            }
            None => None,
        };

        tx.commit()?;
        drop(conn);
        self.notify();

        Ok(Completion {
            finished: event,
            next,
        })
    }
}

impl EventStore for RecordStore {
    fn backend(&self) -> &'static str {
        "records"
    }

    #[instrument(skip(self, event), fields(action = %event.action, timestamp = event.timestamp))]
    fn create(&self, event: NewEvent) -> Result<CreateOutcome> {
        let slug = slug_for(&event.key());
        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock up front, so the existence check and
        // the insert cannot interleave with another process.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = select_active(&tx, &slug)? {
            tx.commit()?;
            debug!(event_id = existing.id, "identical event already scheduled");
            return Ok(CreateOutcome::AlreadyExists(existing));
        }

        let id = insert_record(&tx, &event, &slug)?;
        let created = select_by_id(&tx, id)?;
        tx.commit()?;
        drop(conn);

        debug!(event_id = id, "event created");
        self.notify();
        Ok(CreateOutcome::Created(created))
    }

    fn get(&self, key: &EventKey) -> Result<Option<Event>> {
        let conn = self.conn()?;
        select_active(&conn, &slug_for(key))
    }

    fn find_by_hash(
        &self,
        timestamp: i64,
        action_hash: &str,
        instance: &str,
    ) -> Result<Option<Event>> {
        let conn = self.conn()?;
        select_active(&conn, &format!("{timestamp}-{action_hash}-{instance}"))
    }

    fn find_due(&self, now: i64, window: i64, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM content_records
             WHERE record_type = ?1 AND status = 'pending' AND sort_key <= ?2
             ORDER BY sort_key ASC, id ASC
             LIMIT ?3"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![RECORD_TYPE, now + window, sql_limit(limit)],
            row_to_event,
        )?;
        Ok(collect_rows(rows))
    }

    fn find_due_for_actions(
        &self,
        now: i64,
        window: i64,
        actions: &[String],
        limit: usize,
    ) -> Result<Vec<Event>> {
        if actions.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; actions.len()].join(", ");
        let sql = format!(
            "SELECT {COLUMNS} FROM content_records
             WHERE record_type = ? AND status = 'pending' AND sort_key <= ?
               AND json_extract(payload, '$.action') IN ({placeholders})
             ORDER BY sort_key ASC, id ASC
             LIMIT ?"
        );
        let mut bind = Vec::with_capacity(actions.len() + 3);
        bind.push(SqlValue::Text(RECORD_TYPE.to_string()));
        bind.push(SqlValue::Integer(now + window));
        bind.extend(actions.iter().cloned().map(SqlValue::Text));
        bind.push(SqlValue::Integer(sql_limit(limit)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), row_to_event)?;
        Ok(collect_rows(rows))
    }

    fn next_scheduled(&self, action: &str) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM content_records
             WHERE record_type = ?1 AND status IN ('pending', 'running')
               AND json_extract(payload, '$.action') = ?2
             ORDER BY sort_key ASC, id ASC
             LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![RECORD_TYPE, action], row_to_event)
            .optional()?)
    }

    fn list(&self, status: EventStatus, page: Page) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM content_records
             WHERE record_type = ?1 AND status = ?2
             ORDER BY sort_key ASC, id ASC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![
                RECORD_TYPE,
                status.as_str(),
                sql_limit(page.per_page),
                sql_limit(page.offset())
            ],
            row_to_event,
        )?;
        Ok(collect_rows(rows))
    }

    fn count_by_status(&self, status: EventStatus) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM content_records WHERE record_type = ?1 AND status = ?2",
            params![RECORD_TYPE, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    #[instrument(skip(self), fields(key = %key))]
    fn claim(&self, key: &EventKey, now: i64, lease_secs: i64) -> Result<ClaimOutcome> {
        let slug = slug_for(key);
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE content_records
             SET status = 'running', lease_until = ?1, updated_at = ?2,
                 payload = json_set(payload, '$.claimed_at', ?3)
             WHERE record_type = ?4 AND slug = ?5 AND status = 'pending'",
            params![now + lease_secs, now_rfc3339(), now, RECORD_TYPE, slug],
        )?;
        if n == 0 {
            debug!("claim affected no rows");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let sql = format!(
            "SELECT {COLUMNS} FROM content_records
             WHERE record_type = ?1 AND slug = ?2 AND status = 'running'
             LIMIT 1"
        );
        let event = conn.query_row(&sql, params![RECORD_TYPE, slug], row_to_event)?;
        drop(conn);

        debug!(event_id = event.id, "event claimed");
        self.notify();
        Ok(ClaimOutcome::Claimed(event))
    }

    #[instrument(skip(self), fields(key = %key))]
    fn complete(&self, key: &EventKey, now: i64) -> Result<Completion> {
        self.finish(key, now, None)
    }

    #[instrument(skip(self), fields(key = %key))]
    fn fail(&self, key: &EventKey, reason: &str, now: i64) -> Result<Completion> {
        self.finish(key, now, Some(reason))
    }

    #[instrument(skip(self), fields(key = %key))]
    fn delete(&self, key: &EventKey) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM content_records
             WHERE record_type = ?1 AND slug = ?2 AND status IN ('pending', 'running')",
            params![RECORD_TYPE, slug_for(key)],
        )?;
        drop(conn);
        if n > 0 {
            self.notify();
        }
        Ok(n > 0)
    }

    fn reap_expired_leases(&self, now: i64) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE content_records
             SET status = 'pending', lease_until = NULL, updated_at = ?3,
                 payload = json_set(payload, '$.claimed_at', NULL)
             WHERE record_type = ?1 AND status = 'running'
               AND lease_until IS NOT NULL AND lease_until <= ?2",
            params![RECORD_TYPE, now, now_rfc3339()],
        )?;
        drop(conn);
        if n > 0 {
            warn!(count = n, "expired leases reverted to pending");
            self.notify();
        }
        Ok(n)
    }

    fn purge_finished(&self, older_than: i64) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM content_records
             WHERE record_type = ?1 AND status IN ('completed', 'failed') AND finished_at <= ?2",
            params![RECORD_TYPE, older_than],
        )?;
        if n > 0 {
            info!(count = n, "finished events purged");
        }
        Ok(n)
    }
}

// --- record helpers --------------------------------------------------------

fn slug_for(key: &EventKey) -> String {
    format!(
        "{}-{}-{}",
        key.timestamp,
        hash_action(&key.action),
        key.instance
    )
}

fn insert_record(conn: &Connection, event: &NewEvent, slug: &str) -> Result<i64> {
    let payload = EventPayload {
        action: event.action.clone(),
        action_hashed: hash_action(&event.action),
        instance: event.instance(),
        args: event.args.clone(),
        schedule: event.schedule.clone(),
        claimed_at: None,
        last_error: None,
    };
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO content_records
         (record_type, slug, title, status, sort_key, payload, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6)",
        params![
            RECORD_TYPE,
            slug,
            event.action,
            event.timestamp,
            serde_json::to_string(&payload)?,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn select_active(conn: &Connection, slug: &str) -> Result<Option<Event>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM content_records
         WHERE record_type = ?1 AND slug = ?2 AND status IN ('pending', 'running')
         ORDER BY id ASC
         LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, params![RECORD_TYPE, slug], row_to_event)
        .optional()?)
}

fn select_by_id(conn: &Connection, id: i64) -> Result<Event> {
    let sql = format!("SELECT {COLUMNS} FROM content_records WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_event)?)
}

fn collect_rows<I>(rows: I) -> Vec<Event>
where
    I: Iterator<Item = rusqlite::Result<Event>>,
{
    rows.filter_map(|r| {
        r.map_err(|e| warn!("skipping undecodable cron_event record: {e}"))
            .ok()
    })
    .collect()
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let payload_json: String = row.get(3)?;
    let payload: EventPayload = serde_json::from_str(&payload_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    let status_str: String = row.get(2)?;
    let status = status_str
        .parse::<EventStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;

    Ok(Event {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        action: payload.action,
        instance: payload.instance,
        args: payload.args,
        schedule: payload.schedule,
        status,
        claimed_at: payload.claimed_at,
        lease_expires_at: row.get(4)?,
        last_error: payload.last_error,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
