// library entry
pub mod bucket;
pub mod cache_stats;
pub mod clock;
pub mod code_cache;
pub mod config;
pub mod error;
pub mod http;
pub mod intercept;
pub mod limiter;
pub mod logging;
pub mod masking;
pub mod resilience;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;

#[cfg(test)]
mod tests;

// Re-export key components for convenience
pub use bucket::{BucketId, BucketPolicy, ConsumptionProbe};
pub use cache_stats::{CacheRegistry, CacheStatisticsReporter, StatsSource};
pub use error::{RateLimiterError, Result};
pub use intercept::{RateLimit, RateLimitGuard};
pub use limiter::ApiRateLimiter;
pub use logging::init as init_logging;
pub use storage::{MemoryStorage, RedisStorage, StorageBackend};
