use cronctl_core::CronctlError;
use cronctl_store::StoreError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A recurrence name missing from the interval table.
    #[error("Unknown schedule: {0}")]
    UnknownSchedule(String),

    /// A configured internal event points at a handler nobody registered.
    #[error("Internal event `{action}` names unregistered callback `{callback}`")]
    UnknownCallback { action: String, callback: String },

    #[error("Handler for `{action}` failed: {reason}")]
    Handler { action: String, reason: String },

    /// A legacy cron array that does not have the expected shape.
    #[error("Malformed cron array: {0}")]
    MalformedCronArray(String),
}

impl From<SchedulerError> for CronctlError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Store(e) => e.into(),
            SchedulerError::UnknownSchedule(_) | SchedulerError::MalformedCronArray(_) => {
                CronctlError::Validation(err.to_string())
            }
            SchedulerError::UnknownCallback { .. } => CronctlError::Config(err.to_string()),
            SchedulerError::Handler { action, reason } => CronctlError::Handler { action, reason },
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
