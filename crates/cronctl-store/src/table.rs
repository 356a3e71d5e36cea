use std::sync::{Arc, Mutex, MutexGuard};

use cronctl_core::{
    hash::{hash_action, serialize_args},
    Event, EventKey, EventStatus, NewEvent, Recurrence,
};
use rusqlite::{
    params, params_from_iter,
    types::{Type, Value as SqlValue},
    Connection, OptionalExtension, Row,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    db::create_events_table,
    error::{Result, StoreError},
    store::{
        now_rfc3339, sql_limit, ClaimOutcome, Completion, CreateOutcome, EventStore, Page,
        StoreObserver,
    },
};

const COLUMNS: &str = "id, timestamp, action, instance, args, schedule, interval_secs, status,
                       claimed_at, lease_expires_at, last_error, created_at, updated_at";

/// Event store backed by the dedicated `cron_events` table.
///
/// Wraps a single SQLite connection in a `Mutex`. Cross-process safety comes
/// from SQLite itself: every state change is one conditional statement or an
/// explicit transaction.
pub struct TableStore {
    conn: Mutex<Connection>,
    observer: Option<Arc<dyn StoreObserver>>,
}

impl TableStore {
    /// Wrap `conn`, creating the table and indexes if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        create_events_table(&conn)?;
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
        let tx = conn.transaction()?;

        let mut event = select_active(&tx, key)?.ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        let updated_at = now_rfc3339();

        match failure {
            Some(reason) => {
                tx.execute(
                    "UPDATE cron_events
                     SET status = 'failed', last_error = ?1, claimed_at = NULL,
                         lease_expires_at = NULL, finished_at = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![reason, now, updated_at, event.id],
                )?;
                event.status = EventStatus::Failed;
                event.last_error = Some(reason.to_string());
            }
            // One-shot events leave no trace once they ran.
            None if !event.is_recurring() => {
                tx.execute("DELETE FROM cron_events WHERE id = ?1", [event.id])?;
                event.status = EventStatus::Completed;
            }
            None => {
                tx.execute(
                    "UPDATE cron_events
                     SET status = 'completed', claimed_at = NULL, lease_expires_at = NULL,
                         finished_at = ?1, updated_at = ?2
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
            Some(next) => match insert_event(&tx, &next)? {
                Some(id) => Some(select_by_id(&tx, id)?),
                None => select_active(&tx, &next.key())?,
            },
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

impl EventStore for TableStore {
    fn backend(&self) -> &'static str {
        "table"
    }

    #[instrument(skip(self, event), fields(action = %event.action, timestamp = event.timestamp))]
    fn create(&self, event: NewEvent) -> Result<CreateOutcome> {
        let conn = self.conn()?;
        let outcome = match insert_event(&conn, &event)? {
            Some(id) => CreateOutcome::Created(select_by_id(&conn, id)?),
            None => {
                let existing = select_active(&conn, &event.key())?.ok_or_else(|| {
                    StoreError::Corrupt {
                        id: 0,
                        reason: format!("insert of {} ignored without an active row", event.key()),
                    }
                })?;
                CreateOutcome::AlreadyExists(existing)
            }
        };
        drop(conn);

        if outcome.is_created() {
            debug!(event_id = outcome.event().id, "event created");
            self.notify();
        } else {
            debug!(event_id = outcome.event().id, "identical event already scheduled");
        }
        Ok(outcome)
    }

    fn get(&self, key: &EventKey) -> Result<Option<Event>> {
        let conn = self.conn()?;
        select_active(&conn, key)
    }

    fn find_by_hash(
        &self,
        timestamp: i64,
        action_hash: &str,
        instance: &str,
    ) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM cron_events
             WHERE timestamp = ?1 AND action_hashed = ?2 AND instance = ?3
               AND status IN ('pending', 'running')
             LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![timestamp, action_hash, instance], row_to_event)
            .optional()?)
    }

    fn find_due(&self, now: i64, window: i64, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM cron_events
             WHERE status = 'pending' AND timestamp <= ?1
             ORDER BY timestamp ASC, id ASC
             LIMIT ?2"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![now + window, sql_limit(limit)], row_to_event)?;
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
            "SELECT {COLUMNS} FROM cron_events
             WHERE status = 'pending' AND timestamp <= ? AND action IN ({placeholders})
             ORDER BY timestamp ASC, id ASC
             LIMIT ?"
        );
        let mut bind = Vec::with_capacity(actions.len() + 2);
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
            "SELECT {COLUMNS} FROM cron_events
             WHERE action = ?1 AND status IN ('pending', 'running')
             ORDER BY timestamp ASC, id ASC
             LIMIT 1"
        );
        Ok(conn.query_row(&sql, [action], row_to_event).optional()?)
    }

    fn list(&self, status: EventStatus, page: Page) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM cron_events
             WHERE status = ?1
             ORDER BY timestamp ASC, id ASC
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![
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
            "SELECT COUNT(*) FROM cron_events WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    #[instrument(skip(self), fields(key = %key))]
    fn claim(&self, key: &EventKey, now: i64, lease_secs: i64) -> Result<ClaimOutcome> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE cron_events
             SET status = 'running', claimed_at = ?1, lease_expires_at = ?2, updated_at = ?3
             WHERE timestamp = ?4 AND action = ?5 AND instance = ?6 AND status = 'pending'",
            params![
                now,
                now + lease_secs,
                now_rfc3339(),
                key.timestamp,
                key.action,
                key.instance
            ],
        )?;
        if n == 0 {
            debug!("claim affected no rows");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let sql = format!(
            "SELECT {COLUMNS} FROM cron_events
             WHERE timestamp = ?1 AND action = ?2 AND instance = ?3 AND status = 'running'
             LIMIT 1"
        );
        let event = conn.query_row(
            &sql,
            params![key.timestamp, key.action, key.instance],
            row_to_event,
        )?;
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
            "DELETE FROM cron_events
             WHERE timestamp = ?1 AND action = ?2 AND instance = ?3
               AND status IN ('pending', 'running')",
            params![key.timestamp, key.action, key.instance],
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
            "UPDATE cron_events
             SET status = 'pending', claimed_at = NULL, lease_expires_at = NULL, updated_at = ?2
             WHERE status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1",
            params![now, now_rfc3339()],
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
            "DELETE FROM cron_events
             WHERE status IN ('completed', 'failed') AND finished_at <= ?1",
            [older_than],
        )?;
        if n > 0 {
            info!(count = n, "finished events purged");
        }
        Ok(n)
    }
}

// --- row helpers -----------------------------------------------------------

/// Insert unless an active row holds the same key. Returns the new row id.
fn insert_event(conn: &Connection, event: &NewEvent) -> Result<Option<i64>> {
    let now = now_rfc3339();
    let (schedule, interval) = match &event.schedule {
        Some(r) => (Some(r.name.as_str()), r.interval_secs as i64),
        None => (None, 0),
    };
    // The partial unique index turns a duplicate into a silent no-op.
    let n = conn.execute(
        "INSERT OR IGNORE INTO cron_events
         (timestamp, action, action_hashed, instance, args, schedule, interval_secs,
          status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
        params![
            event.timestamp,
            event.action,
            hash_action(&event.action),
            event.instance(),
            serialize_args(&event.args),
            schedule,
            interval,
            now
        ],
    )?;
    Ok((n > 0).then(|| conn.last_insert_rowid()))
}

fn select_active(conn: &Connection, key: &EventKey) -> Result<Option<Event>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM cron_events
         WHERE timestamp = ?1 AND action = ?2 AND instance = ?3
           AND status IN ('pending', 'running')
         LIMIT 1"
    );
    Ok(conn
        .query_row(
            &sql,
            params![key.timestamp, key.action, key.instance],
            row_to_event,
        )
        .optional()?)
}

fn select_by_id(conn: &Connection, id: i64) -> Result<Event> {
    let sql = format!("SELECT {COLUMNS} FROM cron_events WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_event)?)
}

/// Skip rows that fail to decode rather than wedging every query behind one
/// bad record.
fn collect_rows<I>(rows: I) -> Vec<Event>
where
    I: Iterator<Item = rusqlite::Result<Event>>,
{
    rows.filter_map(|r| {
        r.map_err(|e| warn!("skipping undecodable cron_events row: {e}"))
            .ok()
    })
    .collect()
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let args_json: String = row.get(4)?;
    let args = serde_json::from_str(&args_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    let schedule = row
        .get::<_, Option<String>>(5)?
        .map(|name| -> rusqlite::Result<Recurrence> {
            Ok(Recurrence::new(name, row.get::<_, i64>(6)?.max(0) as u64))
        })
        .transpose()?;

    let status_str: String = row.get(7)?;
    let status = status_str
        .parse::<EventStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, e.into()))?;

    Ok(Event {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        action: row.get(2)?,
        instance: row.get(3)?,
        args,
        schedule,
        status,
        claimed_at: row.get(8)?,
        lease_expires_at: row.get(9)?,
        last_error: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
