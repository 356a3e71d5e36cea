use cronctl_core::Recurrence;

use crate::error::{Result, SchedulerError};

pub const MINUTE: &str = "cronctl_minute";
pub const TEN_MINUTES: &str = "cronctl_ten_minutes";

/// Named recurrences and their intervals in seconds.
pub const INTERVALS: &[(&str, u64)] = &[
    (MINUTE, 60),
    (TEN_MINUTES, 600),
    ("hourly", 3_600),
    ("twicedaily", 43_200),
    ("daily", 86_400),
    ("weekly", 604_800),
];

pub fn interval_for(name: &str) -> Option<u64> {
    INTERVALS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, secs)| *secs)
}

/// Resolve a schedule name into a [`Recurrence`].
pub fn recurrence(name: &str) -> Result<Recurrence> {
    interval_for(name)
        .map(|secs| Recurrence::new(name, secs))
        .ok_or_else(|| SchedulerError::UnknownSchedule(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_resolve() {
        assert_eq!(recurrence("hourly").unwrap().interval_secs, 3_600);
        assert_eq!(interval_for(MINUTE), Some(60));
        assert_eq!(interval_for(TEN_MINUTES), Some(600));
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(matches!(
            recurrence("fortnightly"),
            Err(SchedulerError::UnknownSchedule(name)) if name == "fortnightly"
        ));
    }
}
