// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bucket::BucketPolicy;
use crate::error::{RateLimiterError, Result};
use crate::resilience::StorageFailurePolicy;

/// Settings of the rate limiter façade and the policy shared by all its buckets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum number of tokens a bucket holds
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Tokens added once per elapsed refill interval
    #[serde(default = "default_capacity")]
    pub refill_amount: u64,

    /// Length of one refill interval
    #[serde(default = "default_refill_interval", with = "duration_serde")]
    pub refill_interval: Duration,

    /// What the façade answers when the bucket store fails
    #[serde(default)]
    pub on_storage_error: StorageFailurePolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_amount: default_capacity(),
            refill_interval: default_refill_interval(),
            on_storage_error: StorageFailurePolicy::default(),
        }
    }
}

impl LimiterConfig {
    /// Builds the validated policy described by this configuration
    pub fn policy(&self) -> Result<BucketPolicy> {
        BucketPolicy::builder()
            .capacity(self.capacity)
            .refill_intervally(self.refill_amount, self.refill_interval)
            .build()
    }
}

fn default_capacity() -> u64 {
    3
}

fn default_refill_interval() -> Duration {
    Duration::from_secs(5)
}

/// Naming of the table holding one row per bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketTableConfig {
    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_id_column")]
    pub id_column: String,

    #[serde(default = "default_state_column")]
    pub state_column: String,
}

impl Default for BucketTableConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            id_column: default_id_column(),
            state_column: default_state_column(),
        }
    }
}

fn default_table() -> String {
    "tbl_bucket".to_string()
}

fn default_id_column() -> String {
    "bkno".to_string()
}

fn default_state_column() -> String {
    "state".to_string()
}

/// Row lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long a caller may wait for a row lock before failing
    #[serde(default = "default_lock_wait", with = "duration_serde")]
    pub wait_timeout: Duration,

    /// Lease of a distributed row lock; a crashed holder frees the row after this
    #[serde(default = "default_lock_lease", with = "duration_serde")]
    pub lease: Duration,

    /// First pause between lock attempts
    #[serde(default = "default_initial_backoff", with = "duration_serde")]
    pub initial_backoff: Duration,

    /// Upper bound of the pause between lock attempts
    #[serde(default = "default_max_backoff", with = "duration_serde")]
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout: default_lock_wait(),
            lease: default_lock_lease(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_lock_wait() -> Duration {
    Duration::from_secs(2)
}

fn default_lock_lease() -> Duration {
    Duration::from_secs(5)
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(5)
}

fn default_max_backoff() -> Duration {
    Duration::from_millis(100)
}

/// Configuration for Redis storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Connection timeout
    #[serde(default = "default_conn_timeout", with = "duration_serde")]
    pub connection_timeout: Duration,

    #[serde(default)]
    pub table: BucketTableConfig,

    #[serde(default)]
    pub lock: LockConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connection_timeout: default_conn_timeout(),
            table: BucketTableConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_conn_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Configuration for in-memory storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Maximum number of bucket rows to store
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// How long a caller may wait for a row lock before failing
    #[serde(default = "default_lock_wait", with = "duration_serde")]
    pub lock_wait_timeout: Duration,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            lock_wait_timeout: default_lock_wait(),
        }
    }
}

fn default_max_entries() -> usize {
    10_000
}

/// Which bucket store backs the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Memory,
    Redis,
}

impl FromStr for StorageKind {
    type Err = RateLimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageKind::Memory),
            "redis" => Ok(StorageKind::Redis),
            other => Err(RateLimiterError::Config(format!(
                "unknown storage backend '{}', expected memory or redis",
                other
            ))),
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// JSON file with the code groups and detail codes served by the code cache
    #[serde(default)]
    pub code_table_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            code_table_path: None,
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Everything the server binary needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub storage: StorageKind,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub memory: InMemoryConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Reads the configuration from the process environment.
    ///
    /// Call `dotenv().ok()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AppConfig::default();

        let lock_wait = parse_millis(&lookup, "LOCK_WAIT_TIMEOUT_MS", defaults.redis.lock.wait_timeout)?;
        let lock = LockConfig {
            wait_timeout: lock_wait,
            lease: parse_millis(&lookup, "LOCK_LEASE_MS", defaults.redis.lock.lease)?,
            ..defaults.redis.lock
        };

        let table = BucketTableConfig {
            table: lookup("BUCKET_TABLE").unwrap_or(defaults.redis.table.table),
            id_column: lookup("BUCKET_ID_COLUMN").unwrap_or(defaults.redis.table.id_column),
            state_column: lookup("BUCKET_STATE_COLUMN")
                .unwrap_or(defaults.redis.table.state_column),
        };

        let config = AppConfig {
            limiter: LimiterConfig {
                capacity: parse_var(&lookup, "RATE_LIMIT_CAPACITY", defaults.limiter.capacity)?,
                refill_amount: parse_var(
                    &lookup,
                    "RATE_LIMIT_REFILL_AMOUNT",
                    defaults.limiter.refill_amount,
                )?,
                refill_interval: parse_millis(
                    &lookup,
                    "RATE_LIMIT_REFILL_INTERVAL_MS",
                    defaults.limiter.refill_interval,
                )?,
                on_storage_error: parse_var(
                    &lookup,
                    "RATE_LIMIT_ON_STORAGE_ERROR",
                    defaults.limiter.on_storage_error,
                )?,
            },
            storage: parse_var(&lookup, "STORAGE_BACKEND", defaults.storage)?,
            redis: RedisConfig {
                url: lookup("REDIS_URL").unwrap_or(defaults.redis.url),
                table,
                lock,
                ..defaults.redis
            },
            memory: InMemoryConfig {
                lock_wait_timeout: lock_wait,
                ..defaults.memory
            },
            server: ServerConfig {
                bind_addr: parse_var(&lookup, "BIND_ADDR", defaults.server.bind_addr)?,
                code_table_path: lookup("CODE_TABLE_PATH").map(PathBuf::from),
            },
        };

        // Reject an unusable policy at startup rather than on the first request
        config.limiter.policy()?;

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RateLimiterError::Config(format!("invalid {}='{}': {}", name, raw, e))),
        None => Ok(default),
    }
}

fn parse_millis<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = parse_var(lookup, name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

// Helper module to serialize/deserialize Duration with serde
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_match_reference_policy() {
        let config = AppConfig::from_lookup(|_| None).unwrap();

        assert_eq!(config.limiter.capacity, 3);
        assert_eq!(config.limiter.refill_amount, 3);
        assert_eq!(config.limiter.refill_interval, Duration::from_secs(5));
        assert_eq!(config.limiter.on_storage_error, StorageFailurePolicy::Propagate);
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.redis.table.table, "tbl_bucket");
        assert_eq!(config.redis.table.id_column, "bkno");
        assert_eq!(config.redis.table.state_column, "state");
        assert_eq!(config.server.bind_addr.port(), 8080);
        assert!(config.server.code_table_path.is_none());
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("RATE_LIMIT_CAPACITY", "10"),
            ("RATE_LIMIT_REFILL_AMOUNT", "4"),
            ("RATE_LIMIT_REFILL_INTERVAL_MS", "250"),
            ("RATE_LIMIT_ON_STORAGE_ERROR", "fail_open"),
            ("STORAGE_BACKEND", "redis"),
            ("REDIS_URL", "redis://cache:6380"),
            ("LOCK_WAIT_TIMEOUT_MS", "750"),
            ("BIND_ADDR", "0.0.0.0:9000"),
        ]))
        .unwrap();

        assert_eq!(config.limiter.capacity, 10);
        assert_eq!(config.limiter.refill_amount, 4);
        assert_eq!(config.limiter.refill_interval, Duration::from_millis(250));
        assert_eq!(config.limiter.on_storage_error, StorageFailurePolicy::FailOpen);
        assert_eq!(config.storage, StorageKind::Redis);
        assert_eq!(config.redis.url, "redis://cache:6380");
        assert_eq!(config.redis.lock.wait_timeout, Duration::from_millis(750));
        assert_eq!(config.memory.lock_wait_timeout, Duration::from_millis(750));
        assert_eq!(config.server.bind_addr.port(), 9000);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let result = AppConfig::from_lookup(lookup_from(&[("RATE_LIMIT_CAPACITY", "many")]));
        assert!(matches!(result, Err(RateLimiterError::Config(_))));

        let result = AppConfig::from_lookup(lookup_from(&[("STORAGE_BACKEND", "oracle")]));
        assert!(matches!(result, Err(RateLimiterError::Config(_))));

        // Parses, but is not a usable policy
        let result = AppConfig::from_lookup(lookup_from(&[("RATE_LIMIT_CAPACITY", "0")]));
        assert!(matches!(result, Err(RateLimiterError::Config(_))));
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let json = serde_json::to_value(LimiterConfig::default()).unwrap();
        assert_eq!(json["refill_interval"], 5000);

        let parsed: LimiterConfig =
            serde_json::from_str(r#"{"capacity": 2, "refill_interval": 1500}"#).unwrap();
        assert_eq!(parsed.capacity, 2);
        assert_eq!(parsed.refill_amount, 3);
        assert_eq!(parsed.refill_interval, Duration::from_millis(1500));
    }
}
