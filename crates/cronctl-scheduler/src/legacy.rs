//! Compatibility layer for hosts that still think of the schedule as one
//! nested "cron array": `timestamp -> action -> instance -> event`.
//!
//! Reads are rendered from the store (through the bucketized cache); writes
//! are diffed against the store itself and replayed as individual creates
//! and deletes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cronctl_cache::Bucketizer;
use cronctl_core::{hash::instance_for, EventKey, EventStatus, NewEvent, Recurrence};
use cronctl_store::{Page, SharedStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SchedulerError},
    internal::Supervisor,
    schedules,
};

/// Format version hosts expect in every cron array.
pub const CRON_ARRAY_VERSION: u64 = 2;

const REBUILD_PAGE_SIZE: usize = 100;

/// One entry of the nested array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyEvent {
    /// Recurrence name; `None` for one-shot events.
    pub schedule: Option<String>,
    pub args: Vec<Value>,
    /// Recurrence interval in seconds, 0 for one-shot events.
    pub interval: u64,
}

impl LegacyEvent {
    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "schedule".into(),
            match &self.schedule {
                Some(name) => Value::String(name.clone()),
                None => Value::Bool(false),
            },
        );
        obj.insert("args".into(), Value::Array(self.args.clone()));
        if self.schedule.is_some() {
            obj.insert("interval".into(), Value::from(self.interval));
        }
        Value::Object(obj)
    }

    fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| malformed("event entry is not an object"))?;
        let schedule = match obj.get("schedule") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => None,
            Some(Value::String(name)) => Some(name.clone()),
            Some(other) => return Err(malformed(&format!("bad schedule {other}"))),
        };
        let args = match obj.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(args)) => args.clone(),
            Some(other) => return Err(malformed(&format!("bad args {other}"))),
        };
        let interval = obj.get("interval").and_then(Value::as_u64).unwrap_or(0);
        Ok(Self {
            schedule,
            args,
            interval,
        })
    }
}

pub type InstanceMap = BTreeMap<String, LegacyEvent>;
pub type ActionMap = BTreeMap<String, InstanceMap>;

/// The whole schedule in nested form.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyCronArray {
    pub version: u64,
    pub events: BTreeMap<i64, ActionMap>,
}

impl Default for LegacyCronArray {
    fn default() -> Self {
        Self {
            version: CRON_ARRAY_VERSION,
            events: BTreeMap::new(),
        }
    }
}

impl LegacyCronArray {
    pub fn len(&self) -> usize {
        self.events
            .values()
            .flat_map(|actions| actions.values())
            .map(|instances| instances.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, timestamp: i64, action: &str, instance: &str) -> bool {
        self.events
            .get(&timestamp)
            .and_then(|actions| actions.get(action))
            .is_some_and(|instances| instances.contains_key(instance))
    }

    /// `{"version":2,"<timestamp>":{"<action>":{"<instance>":{...}}}}`
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for (timestamp, actions) in &self.events {
            let actions: Map<String, Value> = actions
                .iter()
                .map(|(action, instances)| {
                    let instances: Map<String, Value> = instances
                        .iter()
                        .map(|(instance, event)| (instance.clone(), event.to_json()))
                        .collect();
                    (action.clone(), Value::Object(instances))
                })
                .collect();
            root.insert(timestamp.to_string(), Value::Object(actions));
        }
        root.insert("version".into(), Value::from(self.version));
        Value::Object(root)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| malformed("cron array is not an object"))?;

        let mut array = Self::default();
        for (key, actions) in root {
            if key == "version" {
                array.version = actions
                    .as_u64()
                    .ok_or_else(|| malformed("version is not a number"))?;
                continue;
            }
            let timestamp: i64 = key
                .parse()
                .map_err(|_| malformed(&format!("bad timestamp key {key}")))?;
            let actions = actions
                .as_object()
                .ok_or_else(|| malformed(&format!("entry {key} is not an object")))?;

            let slot = array.events.entry(timestamp).or_default();
            for (action, instances) in actions {
                let instances = instances
                    .as_object()
                    .ok_or_else(|| malformed(&format!("action {action} is not an object")))?;
                let by_instance = slot.entry(action.clone()).or_default();
                for (instance, event) in instances {
                    by_instance.insert(instance.clone(), LegacyEvent::from_json(event)?);
                }
            }
        }
        Ok(array)
    }
}

/// Flat form of one cron-array entry. This is what the cached view stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollapsedEvent {
    pub timestamp: i64,
    pub action: String,
    pub instance: String,
    pub schedule: Option<String>,
    pub args: Vec<Value>,
    pub interval: u64,
}

impl CollapsedEvent {
    pub fn new(
        timestamp: i64,
        action: impl Into<String>,
        args: Vec<Value>,
        recurrence: Option<&Recurrence>,
    ) -> Self {
        Self {
            timestamp,
            action: action.into(),
            instance: instance_for(&args),
            schedule: recurrence.map(|r| r.name.clone()),
            args,
            interval: recurrence.map_or(0, |r| r.interval_secs),
        }
    }

    fn from_event(event: &cronctl_core::Event) -> Self {
        Self {
            timestamp: event.timestamp,
            action: event.action.clone(),
            instance: event.instance.clone(),
            schedule: event.schedule.as_ref().map(|r| r.name.clone()),
            args: event.args.clone(),
            interval: event.schedule.as_ref().map_or(0, |r| r.interval_secs),
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey::new(self.timestamp, self.action.clone(), self.instance.clone())
    }

    /// Store request for this entry. A zero interval falls back to the
    /// named schedule's interval.
    pub fn to_new_event(&self) -> Result<NewEvent> {
        let schedule = match &self.schedule {
            None => None,
            Some(name) if self.interval > 0 => Some(Recurrence::new(name.clone(), self.interval)),
            Some(name) => Some(schedules::recurrence(name)?),
        };
        Ok(NewEvent {
            timestamp: self.timestamp,
            action: self.action.clone(),
            args: self.args.clone(),
            schedule,
        })
    }
}

/// Flatten a cron array in `(timestamp, action, instance)` order.
pub fn collapse(array: &LegacyCronArray) -> Vec<CollapsedEvent> {
    let mut flat = Vec::with_capacity(array.len());
    for (timestamp, actions) in &array.events {
        for (action, instances) in actions {
            for (instance, event) in instances {
                flat.push(CollapsedEvent {
                    timestamp: *timestamp,
                    action: action.clone(),
                    instance: instance.clone(),
                    schedule: event.schedule.clone(),
                    args: event.args.clone(),
                    interval: event.interval,
                });
            }
        }
    }
    flat
}

/// Rebuild the nested form. Later duplicates of a key win.
pub fn inflate(events: &[CollapsedEvent]) -> LegacyCronArray {
    let mut array = LegacyCronArray::default();
    for event in events {
        array
            .events
            .entry(event.timestamp)
            .or_default()
            .entry(event.action.clone())
            .or_default()
            .insert(
                event.instance.clone(),
                LegacyEvent {
                    schedule: event.schedule.clone(),
                    args: event.args.clone(),
                    interval: event.interval,
                },
            );
    }
    array
}

/// Counts from a [`LegacyAdapter::write`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub created: usize,
    pub deleted: usize,
}

/// Serves and accepts the nested cron array on top of the event store.
pub struct LegacyAdapter {
    store: SharedStore,
    view: Arc<Bucketizer>,
    supervisor: Arc<Supervisor>,
}

impl LegacyAdapter {
    pub fn new(store: SharedStore, view: Arc<Bucketizer>, supervisor: Arc<Supervisor>) -> Self {
        Self {
            store,
            view,
            supervisor,
        }
    }

    /// Current pending schedule in nested form.
    ///
    /// Rows with a non-positive timestamp are dropped from the result and
    /// deleted, so whoever scheduled them can notice and fix it.
    pub fn read(&self) -> Result<LegacyCronArray> {
        if let Some(events) = self.view.read::<CollapsedEvent>() {
            return Ok(inflate(&events));
        }

        // Taken before the scan: a mutation during it makes this publish stale.
        let generation = self.view.generation();
        let flat = self.scan()?;
        if self.view.publish_at(generation, &flat).is_ok() {
            debug!(count = flat.len(), "cron array cached");
        }
        Ok(inflate(&flat))
    }

    /// Replace the schedule with `new`.
    ///
    /// Entries are keyed by the instance recomputed from their args, so a
    /// host that derives instances differently still converges. Entries
    /// missing from the store are created; pending rows missing from `new`
    /// are deleted, except internal events. Both sides are checked against
    /// the store, never the cached view.
    pub fn write(&self, new: &LegacyCronArray) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();
        let mut wanted = BTreeSet::new();

        for mut event in collapse(new) {
            let instance = instance_for(&event.args);
            if instance != event.instance {
                debug!(action = %event.action, given = %event.instance, %instance, "instance rekeyed from args");
                event.instance = instance;
            }
            if event.timestamp <= 0 {
                warn!(action = %event.action, "ignoring event with invalid timestamp");
                continue;
            }
            let key = event.key();
            if !wanted.insert(key.clone()) || self.store.get(&key)?.is_some() {
                continue;
            }
            if self.store.create(event.to_new_event()?)?.is_created() {
                summary.created += 1;
            }
        }

        for event in self.scan()? {
            if wanted.contains(&event.key()) {
                continue;
            }
            if self.supervisor.is_internal_event(&event.action) {
                debug!(action = %event.action, "internal event kept despite removal");
                continue;
            }
            if self.store.delete(&event.key())? {
                summary.deleted += 1;
            }
        }

        info!(
            created = summary.created,
            deleted = summary.deleted,
            "cron array written"
        );
        Ok(summary)
    }

    /// Every pending row, straight from the store, in canonical order.
    fn scan(&self) -> Result<Vec<CollapsedEvent>> {
        let mut rows = Vec::new();
        for page in 1.. {
            let batch = self
                .store
                .list(EventStatus::Pending, Page::new(page, REBUILD_PAGE_SIZE))?;
            let done = batch.len() < REBUILD_PAGE_SIZE;
            rows.extend(batch);
            if done {
                break;
            }
        }

        let mut flat = Vec::with_capacity(rows.len());
        for event in rows {
            if event.timestamp <= 0 {
                warn!(event_id = event.id, action = %event.action, "dropping event with invalid timestamp");
                self.store.delete(&event.key())?;
                continue;
            }
            flat.push(CollapsedEvent::from_event(&event));
        }
        flat.sort_by(|a, b| {
            (a.timestamp, &a.action, &a.instance).cmp(&(b.timestamp, &b.action, &b.instance))
        });
        Ok(flat)
    }

    /// Consulted before every [`schedule`](Self::schedule): returns the
    /// event if it may be created, `None` if an identical one is active.
    pub fn block_duplicate(&self, event: CollapsedEvent) -> Result<Option<CollapsedEvent>> {
        if self.store.get(&event.key())?.is_some() {
            debug!(action = %event.action, timestamp = event.timestamp, "duplicate event blocked");
            return Ok(None);
        }
        Ok(Some(event))
    }

    /// Schedule one event. Returns `false` when it was blocked as a duplicate.
    pub fn schedule(
        &self,
        timestamp: i64,
        action: &str,
        args: Vec<Value>,
        recurrence: Option<&Recurrence>,
    ) -> Result<bool> {
        let candidate = CollapsedEvent::new(timestamp, action, args, recurrence);
        let Some(event) = self.block_duplicate(candidate)? else {
            return Ok(false);
        };
        Ok(self.store.create(event.to_new_event()?)?.is_created())
    }

    pub fn unschedule(&self, timestamp: i64, action: &str, args: &[Value]) -> Result<bool> {
        Ok(self
            .store
            .delete(&EventKey::for_args(timestamp, action, args))?)
    }

    /// Earliest pending timestamp for `action` with exactly these `args`.
    pub fn next_scheduled(&self, action: &str, args: &[Value]) -> Result<Option<i64>> {
        let instance = instance_for(args);
        Ok(collapse(&self.read()?)
            .into_iter()
            .find(|e| e.action == action && e.instance == instance)
            .map(|e| e.timestamp))
    }

    /// Remove every pending occurrence of `action`, whatever its arguments.
    pub fn clear_hook(&self, action: &str) -> Result<usize> {
        if self.supervisor.is_internal_event(action) {
            return Ok(0);
        }
        let mut removed = 0;
        for event in self.scan()? {
            if event.action == action && self.store.delete(&event.key())? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn malformed(reason: &str) -> SchedulerError {
    SchedulerError::MalformedCronArray(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> LegacyCronArray {
        let mut array = LegacyCronArray::default();
        for (ts, action, args, schedule) in [
            (100, "b_action", vec![json!(1)], None),
            (100, "a_action", vec![], Some(("hourly", 3600))),
            (50, "c_action", vec![json!("x")], None),
        ] {
            let instance = instance_for(&args);
            array
                .events
                .entry(ts)
                .or_default()
                .entry(action.to_string())
                .or_default()
                .insert(
                    instance,
                    LegacyEvent {
                        schedule: schedule.map(|(n, _)| n.to_string()),
                        args,
                        interval: schedule.map_or(0, |(_, i)| i),
                    },
                );
        }
        array
    }

    #[test]
    fn collapse_is_canonically_ordered() {
        let flat = collapse(&sample());
        let keys: Vec<_> = flat.iter().map(|e| (e.timestamp, e.action.as_str())).collect();
        assert_eq!(keys, vec![(50, "c_action"), (100, "a_action"), (100, "b_action")]);
    }

    #[test]
    fn collapse_then_inflate_is_identity() {
        let array = sample();
        assert_eq!(inflate(&collapse(&array)), array);

        let flat = collapse(&array);
        assert_eq!(collapse(&inflate(&flat)), flat);
    }

    #[test]
    fn json_form_matches_host_layout() {
        let json = sample().to_json();
        assert_eq!(json["version"], json!(2));
        let recurring = &json["100"]["a_action"][instance_for(&[])];
        assert_eq!(recurring["schedule"], json!("hourly"));
        assert_eq!(recurring["interval"], json!(3600));
        let single = &json["50"]["c_action"][instance_for(&[json!("x")])];
        assert_eq!(single["schedule"], json!(false));
        assert!(single.get("interval").is_none());

        assert_eq!(LegacyCronArray::from_json(&json).unwrap(), sample());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(LegacyCronArray::from_json(&json!([1, 2])).is_err());
        assert!(LegacyCronArray::from_json(&json!({"soon": {}})).is_err());
        assert!(LegacyCronArray::from_json(&json!({"10": {"a": {"i": {"args": 5}}}})).is_err());
    }

    #[test]
    fn zero_interval_uses_named_schedule() {
        let mut event = CollapsedEvent::new(10, "a", vec![], None);
        event.schedule = Some("daily".into());
        let new = event.to_new_event().unwrap();
        assert_eq!(new.schedule.unwrap().interval_secs, 86_400);

        event.schedule = Some("whenever".into());
        assert!(event.to_new_event().is_err());
    }
}
