use thiserror::Error;

/// Reasons a view could not be published. None of them are fatal: the
/// caller keeps serving from the store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// One serialized item exceeds the bucket size on its own.
    #[error("Item of {size} bytes exceeds bucket limit of {limit} bytes")]
    ItemTooLarge { size: usize, limit: usize },

    #[error("View needs {needed} buckets, limit is {max}")]
    TooManyBuckets { needed: usize, max: usize },

    /// The generation moved on while the view was being built.
    #[error("View built for generation {built}, live generation is {live}")]
    Stale { built: u64, live: u64 },

    /// The backing cache refused a write (size limit, eviction, outage).
    #[error("Cache rejected write for key {key}")]
    Rejected { key: String },
}

pub type Result<T> = std::result::Result<T, CacheError>;
