// src/cache_stats/cache.rs

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use crate::cache_stats::{CacheStats, CacheStatsSnapshot, StatsSource};

#[derive(Debug)]
struct Entries<K, V> {
    values: HashMap<K, V>,
    // insertion order, oldest first
    order: VecDeque<K>,
}

/// A bounded in-memory cache that records hits, misses and evictions.
///
/// When full, inserting a new key evicts the oldest inserted entry.
#[derive(Debug)]
pub struct StatsCache<K, V> {
    entries: Mutex<Entries<K, V>>,
    max_entries: usize,
    stats: CacheStats,
}

impl<K, V> StatsCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Entries {
                values: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries: max_entries.max(1),
            stats: CacheStats::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let found = self.lock().values.get(key).cloned();
        match found {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        found
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.lock();

        if let Some(existing) = entries.values.get_mut(&key) {
            *existing = value;
            return;
        }

        while entries.values.len() >= self.max_entries {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.values.remove(&oldest);
                    self.stats.record_eviction();
                }
                None => break,
            }
        }

        entries.order.push_back(key.clone());
        entries.values.insert(key, value);
    }

    /// Returns the cached value, computing and inserting it on a miss
    pub fn get_or_insert_with<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    /// Explicit removal; not counted as an eviction
    pub fn invalidate(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        let removed = entries.values.remove(key);
        if removed.is_some() {
            entries.order.retain(|k| k != key);
        }
        removed
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.lock();
        entries.values.clear();
        entries.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries<K, V>> {
        // A panic while holding the lock leaves the maps consistent; keep serving
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K, V> StatsSource for StatsCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn estimated_size(&self) -> u64 {
        self.len() as u64
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
