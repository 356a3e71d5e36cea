use rusqlite::Connection;

use crate::error::Result;

/// Initialise both store schemas in `conn`.
///
/// Safe to call on every startup. Only the backend selected in config is
/// written to, but creating both keeps a later backend switch painless.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_events_table(conn)?;
    create_content_records_table(conn)?;
    Ok(())
}

/// Dedicated table used by [`crate::TableStore`].
///
/// The partial unique index is the whole dedupe story: it only covers
/// pending and running rows, so finished rows never block rescheduling.
pub fn create_events_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cron_events (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp        INTEGER NOT NULL,
            action           TEXT    NOT NULL,
            action_hashed    TEXT    NOT NULL,   -- md5(action), matched by the run endpoint
            instance         TEXT    NOT NULL,   -- md5(args)
            args             TEXT    NOT NULL,   -- JSON array
            schedule         TEXT,               -- recurrence name, NULL for one-shot
            interval_secs    INTEGER NOT NULL DEFAULT 0,
            status           TEXT    NOT NULL DEFAULT 'pending',
            claimed_at       INTEGER,
            lease_expires_at INTEGER,
            finished_at      INTEGER,
            last_error       TEXT,
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_cron_events_active_key
            ON cron_events (timestamp, action, instance)
            WHERE status IN ('pending', 'running');

        -- Due queue: WHERE status = 'pending' AND timestamp <= ? ORDER BY timestamp
        CREATE INDEX IF NOT EXISTS idx_cron_events_status_ts
            ON cron_events (status, timestamp);

        CREATE INDEX IF NOT EXISTS idx_cron_events_action
            ON cron_events (action, status);
        ",
    )?;
    Ok(())
}

/// Generic content-record table used by [`crate::RecordStore`].
///
/// Knows nothing about events: a record is a typed, slugged JSON document
/// with a status and a sortable key.
pub fn create_content_records_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS content_records (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            record_type TEXT    NOT NULL,
            slug        TEXT    NOT NULL,
            title       TEXT    NOT NULL,
            status      TEXT    NOT NULL,
            sort_key    INTEGER NOT NULL,
            payload     TEXT    NOT NULL,   -- JSON document
            lease_until INTEGER,
            finished_at INTEGER,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_records_type_status_sort
            ON content_records (record_type, status, sort_key);

        CREATE INDEX IF NOT EXISTS idx_records_type_slug
            ON content_records (record_type, slug);
        ",
    )?;
    Ok(())
}
