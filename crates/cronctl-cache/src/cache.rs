use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// Minimal key/value object cache, shaped after memcached.
///
/// Values are strings. A zero TTL means "no expiry". Implementations may
/// refuse or silently drop writes at any time; readers must treat a miss as
/// normal.
pub trait ObjectCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`. Returns `false` if the cache refused it.
    fn set(&self, key: &str, value: String, ttl: Duration) -> bool;

    /// Returns whether a value was removed.
    fn delete(&self, key: &str) -> bool;

    /// Increment a numeric counter, treating a missing or non-numeric value
    /// as zero. Returns the new value.
    fn incr(&self, key: &str) -> u64;
}

pub type SharedCache = Arc<dyn ObjectCache>;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process [`ObjectCache`] on a `DashMap`.
///
/// With `max_item_bytes` set, oversized writes are refused the way a
/// memcached server refuses items above its slab size.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    max_item_bytes: Option<usize>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_item_bytes(limit: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_item_bytes: Some(limit),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn flush(&self) {
        self.entries.clear();
    }
}

impl ObjectCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> bool {
        if let Some(limit) = self.max_item_bytes {
            if value.len() > limit {
                debug!(key, size = value.len(), limit, "cache item refused");
                return false;
            }
        }
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        true
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn incr(&self, key: &str) -> u64 {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::new("0".to_string(), Duration::ZERO));
        let current = if entry.is_expired() {
            0
        } else {
            entry.value.parse::<u64>().unwrap_or(0)
        };
        let next = current.saturating_add(1);
        entry.value = next.to_string();
        if entry.is_expired() {
            entry.expires_at = None;
        }
        next
    }
}
