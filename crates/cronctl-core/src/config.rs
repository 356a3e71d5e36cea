use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";

// REST surface. The external runner builds URLs from these.
pub const API_NAMESPACE: &str = "cron-control/v1";
pub const ENDPOINT_LIST: &str = "events";
pub const ENDPOINT_RUN: &str = "event";

pub const DEFAULT_BUCKET_SIZE_BYTES: usize = 256 * 1024;
pub const DEFAULT_MAX_BUCKETS: usize = 250;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

pub const DEFAULT_QUEUE_SIZE: usize = 10;
pub const DEFAULT_QUEUE_WINDOW_SECS: i64 = 30;
pub const DEFAULT_EXECUTION_BUFFER_SECS: i64 = 15;
pub const DEFAULT_LEASE_SECS: i64 = 300;
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 10;
pub const DEFAULT_RETENTION_SECS: i64 = 86_400;

/// Top-level config (cronctl.toml + CRONCTL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronctlConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Site-specific housekeeping events, re-armed alongside the built-ins.
    #[serde(default)]
    pub internal_events: Vec<InternalEventConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared secret the external runner sends in every request body.
    /// Requests are refused while this is unset.
    pub secret: Option<String>,
    /// Base URL advertised to the runner for the run endpoint.
    /// Derived from bind/port when unset.
    pub public_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            secret: None,
            public_url: None,
        }
    }
}

impl GatewayConfig {
    pub fn base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.bind, self.port),
        }
    }

    /// Absolute URL of the run endpoint.
    pub fn run_url(&self) -> String {
        format!("{}/{}/{}", self.base_url(), API_NAMESPACE, ENDPOINT_RUN)
    }
}

/// Which event-store implementation backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// Dedicated `cron_events` table.
    #[default]
    Table,
    /// Generic `content_records` table.
    Records,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default)]
    pub backend: StoreBackend,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            backend: StoreBackend::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound for a single cached bucket payload.
    #[serde(default = "default_bucket_size")]
    pub bucket_size_bytes: usize,
    /// Generations needing more buckets than this are not cached at all.
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bucket_size_bytes: DEFAULT_BUCKET_SIZE_BYTES,
            max_buckets: DEFAULT_MAX_BUCKETS,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// User events returned per list call (internal events come on top).
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Look-ahead applied when selecting due events.
    #[serde(default = "default_queue_window")]
    pub queue_window_secs: i64,
    /// How far ahead of its timestamp an event may be run.
    #[serde(default = "default_execution_buffer")]
    pub execution_buffer_secs: i64,
    /// Claim lifetime before a running event is considered abandoned.
    #[serde(default = "default_lease")]
    pub lease_secs: i64,
    /// Concurrent user-event executions per gateway process.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Age after which completed and failed rows are purged.
    #[serde(default = "default_retention")]
    pub retention_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            queue_window_secs: DEFAULT_QUEUE_WINDOW_SECS,
            execution_buffer_secs: DEFAULT_EXECUTION_BUFFER_SECS,
            lease_secs: DEFAULT_LEASE_SECS,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            retention_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

/// An additional internal event: `callback` names a handler that the host
/// registers before the supervisor runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalEventConfig {
    pub schedule: String,
    pub action: String,
    pub callback: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_bucket_size() -> usize {
    DEFAULT_BUCKET_SIZE_BYTES
}
fn default_max_buckets() -> usize {
    DEFAULT_MAX_BUCKETS
}
fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}
fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}
fn default_queue_window() -> i64 {
    DEFAULT_QUEUE_WINDOW_SECS
}
fn default_execution_buffer() -> i64 {
    DEFAULT_EXECUTION_BUFFER_SECS
}
fn default_lease() -> i64 {
    DEFAULT_LEASE_SECS
}
fn default_max_concurrent_runs() -> usize {
    DEFAULT_MAX_CONCURRENT_RUNS
}
fn default_retention() -> i64 {
    DEFAULT_RETENTION_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronctl/cronctl.db", home)
}

impl CronctlConfig {
    /// Load config from a TOML file with CRONCTL_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `CRONCTL_GATEWAY__SECRET`.
    /// A missing file is not an error; defaults fill every gap.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::from(Serialized::defaults(CronctlConfig::default()))
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CRONCTL_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: CronctlConfig = figment
            .extract()
            .map_err(|e| crate::error::CronctlError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave silently.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CronctlError::Config;

        if self.cache.bucket_size_bytes == 0 {
            return Err(Config("cache.bucket_size_bytes must be positive".into()));
        }
        if self.cache.max_buckets == 0 {
            return Err(Config("cache.max_buckets must be positive".into()));
        }
        if self.scheduler.lease_secs <= 0 {
            return Err(Config("scheduler.lease_secs must be positive".into()));
        }
        if self.scheduler.queue_window_secs < 0 || self.scheduler.execution_buffer_secs < 0 {
            return Err(Config("scheduler windows cannot be negative".into()));
        }
        if self.scheduler.max_concurrent_runs == 0 {
            return Err(Config("scheduler.max_concurrent_runs must be positive".into()));
        }
        if let Some(secret) = &self.gateway.secret {
            if secret.trim().is_empty() {
                return Err(Config("gateway.secret cannot be blank".into()));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronctl/cronctl.toml", home)
}
