// src/cache_stats/reporter.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache_stats::CacheRegistry;

/// Live counters of one cache as served by the monitoring endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub size: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub eviction_count: u64,
}

/// Reads every registered cache's counters on demand. Nothing is cached here.
#[derive(Debug, Clone)]
pub struct CacheStatisticsReporter {
    registry: Arc<CacheRegistry>,
}

impl CacheStatisticsReporter {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// One entry per registered cache that is still alive
    pub fn get_cache_statistics(&self) -> BTreeMap<String, CacheMetrics> {
        let mut report = BTreeMap::new();

        for name in self.registry.cache_names() {
            let Some(cache) = self.registry.get(&name) else {
                debug!(cache = %name, "Skipping cache with no live instance");
                continue;
            };

            let stats = cache.stats();
            let size = cache.estimated_size();
            let metrics = CacheMetrics {
                size,
                hit_count: stats.hit_count,
                miss_count: stats.miss_count,
                hit_rate: stats.hit_rate(),
                miss_rate: stats.miss_rate(),
                eviction_count: stats.eviction_count,
            };

            info!(
                "Cache '{}' statistics: hit rate = {:.2}%, size = {}",
                name,
                metrics.hit_rate * 100.0,
                size
            );

            report.insert(name, metrics);
        }

        report
    }
}
