//! `cronctl-core`: types, hashing and configuration shared by every cronctl crate.

pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use error::{CronctlError, Result};
pub use types::{Event, EventKey, EventStatus, NewEvent, Recurrence};
