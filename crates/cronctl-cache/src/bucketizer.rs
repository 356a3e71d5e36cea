use std::time::Duration;

use cronctl_core::{config::CacheConfig, hash::md5_hex};
use cronctl_store::StoreObserver;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    cache::SharedCache,
    error::{CacheError, Result},
};

/// Stored under the view key once every bucket of a generation is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMetadata {
    /// Generation the buckets belong to.
    pub incrementer: u64,
    pub buckets: usize,
    pub event_count: usize,
}

/// Splits a serialized view across bounded cache entries.
///
/// Publishing writes every bucket before the metadata, and readers only
/// trust metadata whose `incrementer` still equals the live generation
/// counter. Bumping that counter ([`invalidate`](Self::invalidate)) orphans
/// the previous generation without touching it; its keys simply expire.
pub struct Bucketizer {
    cache: SharedCache,
    view_key: String,
    bucket_size: usize,
    max_buckets: usize,
    ttl: Duration,
}

impl Bucketizer {
    pub fn new(cache: SharedCache, view_key: impl Into<String>, config: &CacheConfig) -> Self {
        Self {
            cache,
            view_key: view_key.into(),
            bucket_size: config.bucket_size_bytes,
            max_buckets: config.max_buckets,
            ttl: Duration::from_secs(config.ttl_secs),
        }
    }

    pub fn view_key(&self) -> &str {
        &self.view_key
    }

    fn generation_key(&self) -> String {
        format!("{}_incrementer", self.view_key)
    }

    /// Live generation counter. Zero until the first invalidation.
    pub fn generation(&self) -> u64 {
        self.cache
            .get(&self.generation_key())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn bucket_key(&self, incrementer: u64, index: usize) -> String {
        md5_hex(format!("{}{}{}", self.view_key, incrementer, index))
    }

    pub fn metadata(&self) -> Option<ViewMetadata> {
        let raw = self.cache.get(&self.view_key)?;
        serde_json::from_str(&raw).ok()
    }

    /// Start a new generation; readers miss until the next publish.
    pub fn invalidate(&self) -> u64 {
        let generation = self.cache.incr(&self.generation_key());
        debug!(view = %self.view_key, generation, "cached view invalidated");
        generation
    }

    /// Cache `items` as the current generation. Returns the bucket count.
    ///
    /// Nothing is published when an item or the whole view does not fit;
    /// the error says why and readers keep missing.
    pub fn publish<T: Serialize>(&self, items: &[T]) -> Result<usize> {
        self.publish_at(self.generation(), items)
    }

    /// Cache `items` as generation `incrementer`, read before the items were
    /// gathered. If the generation has moved since, the metadata is not
    /// written and readers keep missing.
    pub fn publish_at<T: Serialize>(&self, incrementer: u64, items: &[T]) -> Result<usize> {
        let buckets = match self.pack(items) {
            Ok(buckets) => buckets,
            Err(e) => {
                warn!(view = %self.view_key, "view not cached: {e}");
                return Err(e);
            }
        };

        for (index, payload) in buckets.iter().enumerate() {
            let key = self.bucket_key(incrementer, index);
            if !self.cache.set(&key, payload.clone(), self.ttl) {
                warn!(view = %self.view_key, index, "bucket write refused, view not cached");
                return Err(CacheError::Rejected { key });
            }
        }

        let live = self.generation();
        if live != incrementer {
            debug!(view = %self.view_key, built = incrementer, live, "stale view not published");
            return Err(CacheError::Stale {
                built: incrementer,
                live,
            });
        }

        let meta = ViewMetadata {
            incrementer,
            buckets: buckets.len(),
            event_count: items.len(),
        };
        if !self
            .cache
            .set(&self.view_key, serde_json::to_string(&meta)?, self.ttl)
        {
            return Err(CacheError::Rejected {
                key: self.view_key.clone(),
            });
        }

        debug!(
            view = %self.view_key,
            incrementer,
            buckets = meta.buckets,
            event_count = meta.event_count,
            "view published"
        );
        Ok(meta.buckets)
    }

    /// Reassemble the current generation. Any gap reads as `None`.
    pub fn read<T: DeserializeOwned>(&self) -> Option<Vec<T>> {
        let meta = self.metadata()?;
        if meta.incrementer != self.generation() {
            return None;
        }

        let mut items = Vec::with_capacity(meta.event_count);
        for index in 0..meta.buckets {
            let raw = self.cache.get(&self.bucket_key(meta.incrementer, index))?;
            match serde_json::from_str::<Vec<T>>(&raw) {
                Ok(chunk) => items.extend(chunk),
                Err(e) => {
                    debug!(view = %self.view_key, index, "undecodable bucket: {e}");
                    return None;
                }
            }
        }

        (items.len() == meta.event_count).then_some(items)
    }

    /// Greedy, order-preserving fill. Each payload is a JSON array whose
    /// byte length never exceeds `bucket_size`.
    fn pack<T: Serialize>(&self, items: &[T]) -> Result<Vec<String>> {
        let mut buckets = Vec::new();
        let mut current = String::from("[");

        for item in items {
            let encoded = serde_json::to_string(item)?;
            if encoded.len() + 2 > self.bucket_size {
                return Err(CacheError::ItemTooLarge {
                    size: encoded.len(),
                    limit: self.bucket_size,
                });
            }

            let separator = usize::from(current.len() > 1);
            if current.len() + separator + encoded.len() + 1 > self.bucket_size {
                current.push(']');
                buckets.push(std::mem::replace(&mut current, String::from("[")));
            }
            if current.len() > 1 {
                current.push(',');
            }
            current.push_str(&encoded);

            if buckets.len() >= self.max_buckets {
                return Err(CacheError::TooManyBuckets {
                    needed: buckets.len() + 1,
                    max: self.max_buckets,
                });
            }
        }

        if current.len() > 1 {
            current.push(']');
            buckets.push(current);
        }
        Ok(buckets)
    }
}

impl StoreObserver for Bucketizer {
    fn on_mutation(&self) {
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, ObjectCache};
    use std::sync::Arc;

    fn bucketizer(bucket_size: usize, max_buckets: usize) -> (Arc<MemoryCache>, Bucketizer) {
        let cache = Arc::new(MemoryCache::new());
        let config = CacheConfig {
            bucket_size_bytes: bucket_size,
            max_buckets,
            ttl_secs: 0,
        };
        let b = Bucketizer::new(cache.clone(), "cron_view", &config);
        (cache, b)
    }

    #[test]
    fn buckets_never_exceed_the_byte_limit() {
        let (_, b) = bucketizer(20, 100);
        let items: Vec<String> = (0..10).map(|i| format!("item-{i}")).collect();
        let buckets = b.pack(&items).unwrap();

        assert!(buckets.len() > 1);
        for payload in &buckets {
            assert!(payload.len() <= 20, "{payload} is {} bytes", payload.len());
        }
        let rejoined: Vec<String> = buckets
            .iter()
            .flat_map(|p| serde_json::from_str::<Vec<String>>(p).unwrap())
            .collect();
        assert_eq!(rejoined, items);
    }

    #[test]
    fn exact_fit_stays_in_one_bucket() {
        // ["ab","cd"] is 11 bytes.
        let (_, b) = bucketizer(11, 10);
        assert_eq!(b.pack(&["ab", "cd"]).unwrap(), vec![r#"["ab","cd"]"#]);
        let (_, b) = bucketizer(10, 10);
        assert_eq!(b.pack(&["ab", "cd"]).unwrap().len(), 2);
    }

    #[test]
    fn empty_view_round_trips() {
        let (_, b) = bucketizer(64, 4);
        assert_eq!(b.publish::<String>(&[]).unwrap(), 0);
        assert_eq!(b.read::<String>(), Some(vec![]));
    }

    #[test]
    fn oversized_item_is_uncacheable() {
        let (cache, b) = bucketizer(8, 4);
        let err = b.publish(&["this is far too long"]).unwrap_err();
        assert!(matches!(err, CacheError::ItemTooLarge { .. }));
        assert!(cache.get("cron_view").is_none());
    }

    #[test]
    fn too_many_buckets_skips_caching() {
        let (cache, b) = bucketizer(8, 2);
        let err = b.publish(&["aaaa", "bbbb", "cccc"]).unwrap_err();
        assert!(matches!(err, CacheError::TooManyBuckets { max: 2, .. }));
        assert!(cache.get("cron_view").is_none());
        assert!(b.read::<String>().is_none());
    }

    #[test]
    fn invalidation_orphans_published_view() {
        let (_, b) = bucketizer(64, 4);
        b.publish(&[1, 2, 3]).unwrap();
        assert_eq!(b.read::<i32>(), Some(vec![1, 2, 3]));

        b.on_mutation();
        assert!(b.read::<i32>().is_none());

        b.publish(&[4]).unwrap();
        assert_eq!(b.read::<i32>(), Some(vec![4]));
        assert_eq!(b.metadata().unwrap().incrementer, 1);
    }

    #[test]
    fn view_built_before_invalidation_is_not_published() {
        let (_, b) = bucketizer(64, 4);
        b.publish(&[1, 2]).unwrap();

        let built_for = b.generation();
        b.on_mutation();
        let err = b.publish_at(built_for, &[1, 2]).unwrap_err();

        assert!(matches!(err, CacheError::Stale { built: 0, live: 1 }));
        assert!(b.read::<i32>().is_none());
        assert_eq!(b.metadata().unwrap().incrementer, 0);
    }

    #[test]
    fn refused_bucket_write_leaves_no_metadata() {
        let cache = Arc::new(MemoryCache::with_max_item_bytes(5));
        let config = CacheConfig {
            bucket_size_bytes: 64,
            max_buckets: 4,
            ttl_secs: 0,
        };
        let b = Bucketizer::new(cache.clone(), "cron_view", &config);
        assert!(matches!(
            b.publish(&["longer than five"]),
            Err(CacheError::Rejected { .. })
        ));
        assert!(b.metadata().is_none());
    }
}
