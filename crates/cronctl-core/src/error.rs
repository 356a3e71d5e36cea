use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronctlError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad or missing secret, malformed request data, premature run.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Event not found: {key}")]
    NotFound { key: String },

    /// Lost the claim race. Expected under concurrency.
    #[error("Event already claimed: {key}")]
    AlreadyClaimed { key: String },

    /// Every execution slot is taken; the runner should retry later.
    #[error("Busy: {0}")]
    Busy(String),

    #[error("Handler for `{action}` failed: {reason}")]
    Handler { action: String, reason: String },

    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CronctlError {
    /// Short error code string included in gateway responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CronctlError::Config(_) => "CONFIG_ERROR",
            CronctlError::Validation(_) => "VALIDATION_ERROR",
            CronctlError::NotFound { .. } => "NOT_FOUND",
            CronctlError::AlreadyClaimed { .. } => "ALREADY_CLAIMED",
            CronctlError::Busy(_) => "BUSY",
            CronctlError::Handler { .. } => "HANDLER_ERROR",
            CronctlError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            CronctlError::Serialization(_) => "SERIALIZATION_ERROR",
            CronctlError::Io(_) => "IO_ERROR",
            CronctlError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the failure belongs in the response body (`success: false`)
    /// rather than surfacing as a request-level fault.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            CronctlError::Validation(_)
                | CronctlError::NotFound { .. }
                | CronctlError::AlreadyClaimed { .. }
                | CronctlError::Busy(_)
                | CronctlError::Handler { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CronctlError>;
