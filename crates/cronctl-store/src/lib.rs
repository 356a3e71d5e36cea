//! `cronctl-store`: durable storage for scheduled events.
//!
//! # Backends
//!
//! | Backend       | Storage                                                 |
//! |---------------|---------------------------------------------------------|
//! | `TableStore`  | Dedicated `cron_events` table, partial unique index     |
//! | `RecordStore` | Generic `content_records` documents, slug-keyed         |
//!
//! Both implement [`EventStore`] and pass the same contract suite
//! (`tests/contract.rs`). Callers hold a [`SharedStore`] and never branch on
//! the backend.

pub mod db;
pub mod error;
pub mod records;
pub mod store;
pub mod table;

pub use error::{Result, StoreError};
pub use records::RecordStore;
pub use store::{
    ClaimOutcome, Completion, CreateOutcome, EventStore, Page, SharedStore, StoreObserver,
};
pub use table::TableStore;

use cronctl_core::config::StoreBackend;
use rusqlite::Connection;
use std::sync::Arc;

/// Open the configured backend over `conn`, initialising its schema.
pub fn open(backend: StoreBackend, conn: Connection) -> Result<SharedStore> {
    Ok(match backend {
        StoreBackend::Table => Arc::new(TableStore::new(conn)?),
        StoreBackend::Records => Arc::new(RecordStore::new(conn)?),
    })
}

/// Like [`open`], notifying `observer` after every mutation.
pub fn open_observed(
    backend: StoreBackend,
    conn: Connection,
    observer: Arc<dyn StoreObserver>,
) -> Result<SharedStore> {
    Ok(match backend {
        StoreBackend::Table => Arc::new(TableStore::new(conn)?.with_observer(observer)),
        StoreBackend::Records => Arc::new(RecordStore::new(conn)?.with_observer(observer)),
    })
}
