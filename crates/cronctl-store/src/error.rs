use thiserror::Error;

/// Errors that can occur within the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error. The store is unusable.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row exists but holds values the store cannot interpret.
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: i64, reason: String },

    /// No active event exists for the given key.
    #[error("Event not found: {key}")]
    NotFound { key: String },

    /// A thread panicked while holding the connection.
    #[error("Connection lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// True when the backing storage itself failed, as opposed to a lookup miss.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Poisoned)
    }
}

impl From<StoreError> for cronctl_core::CronctlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key } => cronctl_core::CronctlError::NotFound { key },
            other => cronctl_core::CronctlError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
