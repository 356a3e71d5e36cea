//! `cronctl-cache`: object cache abstraction and the bucketized view cache.
//!
//! A full event view can outgrow the per-item limit of memcached-style
//! caches. [`Bucketizer`] splits the serialized view across bounded buckets
//! and reassembles it on read, treating any missing piece as a miss.

pub mod bucketizer;
pub mod cache;
pub mod error;

pub use bucketizer::{Bucketizer, ViewMetadata};
pub use cache::{MemoryCache, ObjectCache, SharedCache};
pub use error::{CacheError, Result};
