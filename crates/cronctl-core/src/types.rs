use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::hash::instance_for;

/// Identity of a scheduled event: `(timestamp, action, instance)`.
///
/// Unique among active (pending or running) events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub timestamp: i64,
    pub action: String,
    /// md5 of the serialized argument payload.
    pub instance: String,
}

impl EventKey {
    pub fn new(timestamp: i64, action: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            timestamp,
            action: action.into(),
            instance: instance.into(),
        }
    }

    /// Build the key an event with these arguments would be stored under.
    pub fn for_args(timestamp: i64, action: impl Into<String>, args: &[Value]) -> Self {
        Self::new(timestamp, action, instance_for(args))
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.timestamp, self.action, self.instance)
    }
}

/// Recurrence descriptor: a named schedule and its interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub name: String,
    pub interval_secs: u64,
}

impl Recurrence {
    pub fn new(name: impl Into<String>, interval_secs: u64) -> Self {
        Self {
            name: name.into(),
            interval_secs,
        }
    }

    /// Timestamp of the occurrence following one nominally due at `previous`.
    ///
    /// An event run early (or on time) fires again one interval from `now`.
    /// A late event stays aligned to its original cadence: the next slot is
    /// the first multiple of the interval after `now`, measured from
    /// `previous`. Returns `None` for a zero interval.
    pub fn next_after(&self, previous: i64, now: i64) -> Option<i64> {
        if self.interval_secs == 0 {
            return None;
        }
        let interval = self.interval_secs as i64;
        if previous >= now {
            Some(now + interval)
        } else {
            Some(now + (interval - ((now - previous) % interval)))
        }
    }
}

/// Lifecycle state of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for its timestamp and a claim.
    Pending,
    /// Claimed by an executor; holds a lease.
    Running,
    /// Handler returned successfully.
    Completed,
    /// Handler returned an error or panicked.
    Failed,
}

impl EventStatus {
    pub const ALL: [EventStatus; 4] = [
        EventStatus::Pending,
        EventStatus::Running,
        EventStatus::Completed,
        EventStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Running => "running",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    /// Pending and running rows participate in the uniqueness invariant.
    pub fn is_active(&self) -> bool {
        matches!(self, EventStatus::Pending | EventStatus::Running)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "running" => Ok(EventStatus::Running),
            "completed" => Ok(EventStatus::Completed),
            "failed" => Ok(EventStatus::Failed),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// A persisted event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned creation sequence; breaks timestamp ties.
    pub id: i64,
    /// Nominal fire time, epoch seconds.
    pub timestamp: i64,
    /// Name of the registered handler.
    pub action: String,
    /// md5 of the serialized argument payload.
    pub instance: String,
    /// Ordered parameters passed to the handler.
    pub args: Vec<Value>,
    /// `None` for one-shot events.
    pub schedule: Option<Recurrence>,
    pub status: EventStatus,
    /// Epoch seconds at which the current claim was taken.
    pub claimed_at: Option<i64>,
    /// Epoch seconds after which a running claim is considered abandoned.
    pub lease_expires_at: Option<i64>,
    /// Reason recorded by the last failed execution.
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Event {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.timestamp, self.action.clone(), self.instance.clone())
    }

    pub fn is_recurring(&self) -> bool {
        self.schedule.is_some()
    }
}

/// A schedule request, before the store assigns identity and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub timestamp: i64,
    pub action: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub schedule: Option<Recurrence>,
}

impl NewEvent {
    pub fn once(timestamp: i64, action: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            timestamp,
            action: action.into(),
            args,
            schedule: None,
        }
    }

    pub fn recurring(
        timestamp: i64,
        action: impl Into<String>,
        args: Vec<Value>,
        schedule: Recurrence,
    ) -> Self {
        Self {
            timestamp,
            action: action.into(),
            args,
            schedule: Some(schedule),
        }
    }

    pub fn instance(&self) -> String {
        instance_for(&self.args)
    }

    pub fn key(&self) -> EventKey {
        EventKey::new(self.timestamp, self.action.clone(), self.instance())
    }

    /// The next occurrence of `event`, if it recurs.
    pub fn next_occurrence(event: &Event, now: i64) -> Option<Self> {
        let schedule = event.schedule.as_ref()?;
        let timestamp = schedule.next_after(event.timestamp, now)?;
        Some(Self {
            timestamp,
            action: event.action.clone(),
            args: event.args.clone(),
            schedule: Some(schedule.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_strings() {
        for status in EventStatus::ALL {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("complete".parse::<EventStatus>().is_err());
    }

    #[test]
    fn early_run_reschedules_one_interval_from_now() {
        let r = Recurrence::new("hourly", 3600);
        assert_eq!(r.next_after(1_000, 900), Some(900 + 3600));
        assert_eq!(r.next_after(1_000, 1_000), Some(1_000 + 3600));
    }

    #[test]
    fn late_run_stays_on_cadence() {
        let r = Recurrence::new("ten", 600);
        // Nominal at 0, run at 1_450: slots are 600, 1_200, 1_800.
        assert_eq!(r.next_after(0, 1_450), Some(1_800));
    }

    #[test]
    fn zero_interval_never_recurs() {
        assert_eq!(Recurrence::new("broken", 0).next_after(0, 10), None);
    }

    #[test]
    fn key_for_args_matches_new_event_key() {
        let ev = NewEvent::once(42, "publish_post", vec![json!(7)]);
        assert_eq!(ev.key(), EventKey::for_args(42, "publish_post", &[json!(7)]));
        assert_eq!(ev.key().to_string(), format!("42-publish_post-{}", ev.instance()));
    }
}
