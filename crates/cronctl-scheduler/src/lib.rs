//! `cronctl-scheduler`: decides what runs and when.
//!
//! # Components
//!
//! | Type            | Role                                                        |
//! |-----------------|-------------------------------------------------------------|
//! | `ActionRegistry`| Action name to [`EventHandler`] bindings                    |
//! | `DueQueue`      | Builds the list of due, runnable events                     |
//! | `LockManager`   | Lease-based claims plus per-process run slots               |
//! | `EventRunner`   | Claim, execute, complete or fail a single event             |
//! | `Supervisor`    | Keeps internal housekeeping events scheduled                |
//! | `LegacyAdapter` | Nested cron-array view over the store                       |
//!
//! # Schedules
//!
//! Recurring events name one of the intervals in [`schedules::INTERVALS`]
//! (`cronctl_minute`, `cronctl_ten_minutes`, `hourly`, `twicedaily`,
//! `daily`, `weekly`).

pub mod error;
pub mod internal;
pub mod legacy;
pub mod lock;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod schedules;

pub use error::{Result, SchedulerError};
pub use internal::{InternalEvent, Supervisor};
pub use legacy::{collapse, inflate, CollapsedEvent, LegacyAdapter, LegacyCronArray, LegacyEvent};
pub use lock::{LockManager, TryClaim};
pub use queue::{DueEvents, DueQueue};
pub use registry::{handler_fn, ActionRegistry, EventContext, EventHandler};
pub use runner::{EventRunner, RunOutcome, RunRequest};
