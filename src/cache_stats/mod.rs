// src/cache_stats/mod.rs
//! Hit/miss/eviction counters of named in-memory caches, read on demand.

mod cache;
mod registry;
mod reporter;
mod stats;


pub use cache::StatsCache;
pub use registry::CacheRegistry;
pub use reporter::{CacheMetrics, CacheStatisticsReporter};
pub use stats::{CacheStats, CacheStatsSnapshot, StatsSource};
