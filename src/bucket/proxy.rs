// src/bucket/proxy.rs

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::bucket::{BucketHandle, BucketId, BucketPolicy, ConsumptionProbe, PersistentBucketStore};
use crate::cache_stats::{CacheStats, CacheStatsSnapshot, StatsSource};
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::StorageBackend;

/// In-process handle to one persisted bucket
#[derive(Debug)]
pub struct BucketProxy<S>
where
    S: StorageBackend,
{
    key: String,
    handle: BucketHandle,
    store: Arc<PersistentBucketStore<S>>,
}

impl<S> BucketProxy<S>
where
    S: StorageBackend,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bucket_id(&self) -> BucketId {
        self.handle.bucket_id()
    }

    pub fn policy(&self) -> &BucketPolicy {
        self.handle.policy()
    }

    pub async fn try_consume(&self, tokens: u64) -> Result<bool> {
        self.store.try_consume(&self.handle, tokens).await
    }

    pub async fn try_consume_and_probe(&self, tokens: u64) -> Result<ConsumptionProbe> {
        self.store.try_consume_and_probe(&self.handle, tokens).await
    }

    pub async fn available_tokens(&self) -> Result<u64> {
        self.store.available_tokens(&self.handle).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.store.reset(&self.handle).await
    }
}

type ProxySlot<S> = Arc<OnceCell<Arc<BucketProxy<S>>>>;

/// Key → proxy map with single-flight construction.
///
/// Concurrent first lookups of one key share a slot; only one of them runs
/// [`PersistentBucketStore::get_or_create`] and the rest receive its proxy.
/// A failed construction drops the slot again, so keys that never got a
/// proxy do not accumulate.
///
/// When the table refuses a new row the cache reclaims buckets that have
/// refilled to capacity (see [`evict_idle`](Self::evict_idle)) and retries once.
///
/// Lookups are counted: a key whose proxy already exists is a hit. Reclaimed
/// proxies count as evictions.
#[derive(Debug)]
pub struct ProxyCache<S>
where
    S: StorageBackend,
{
    store: Arc<PersistentBucketStore<S>>,
    policy: Arc<BucketPolicy>,
    proxies: RwLock<HashMap<String, ProxySlot<S>>>,
    stats: CacheStats,
}

impl<S> ProxyCache<S>
where
    S: StorageBackend,
{
    pub fn new(store: Arc<PersistentBucketStore<S>>, policy: BucketPolicy) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
            proxies: RwLock::new(HashMap::new()),
            stats: CacheStats::new(),
        }
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<PersistentBucketStore<S>> {
        &self.store
    }

    pub async fn get_or_create_bucket(&self, key: &str) -> Result<Arc<BucketProxy<S>>> {
        let slot = self.slot(key)?;
        if slot.initialized() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }

        match self.init_slot(key, &slot).await {
            Err(RateLimiterError::Storage(StorageError::TableFull(limit))) => {
                if self.evict_idle().await? == 0 {
                    return Err(RateLimiterError::Storage(StorageError::TableFull(limit)));
                }
                let slot = self.slot(key)?;
                self.init_slot(key, &slot).await
            }
            other => other,
        }
    }

    /// Tokens `key`'s bucket would hold right now. Creates neither a row nor a proxy.
    pub async fn available_tokens(&self, key: &str) -> Result<u64> {
        let handle = self
            .store
            .handle(BucketId::from_key(key), Arc::clone(&self.policy));
        self.store.available_tokens(&handle).await
    }

    /// Drops every cached bucket that has refilled to capacity, deleting its row.
    ///
    /// Returns how many were reclaimed. A proxy still held by a caller keeps
    /// working: its next call finds no row and starts over from a full bucket.
    pub async fn evict_idle(&self) -> Result<usize> {
        let cached: Vec<(String, ProxySlot<S>)> = {
            let proxies = self.proxies.read().map_err(|_| poisoned())?;
            proxies
                .iter()
                .filter(|(_, slot)| slot.initialized())
                .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
                .collect()
        };

        let mut reclaimed = 0;
        for (key, slot) in cached {
            let Some(proxy) = slot.get() else {
                continue;
            };
            match self.store.remove_if_full(&proxy.handle).await {
                Ok(true) => {
                    self.forget(&key, &slot)?;
                    reclaimed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "Could not reclaim bucket row"),
            }
        }

        if reclaimed > 0 {
            self.stats.record_evictions(reclaimed as u64);
            info!(reclaimed, "Reclaimed idle bucket rows");
        }
        Ok(reclaimed)
    }

    async fn init_slot(&self, key: &str, slot: &ProxySlot<S>) -> Result<Arc<BucketProxy<S>>> {
        let initialized = slot
            .get_or_try_init(|| async {
                let bucket_id = BucketId::from_key(key);
                let handle = self
                    .store
                    .get_or_create(bucket_id, Arc::clone(&self.policy))
                    .await?;

                Ok::<_, RateLimiterError>(Arc::new(BucketProxy {
                    key: key.to_string(),
                    handle,
                    store: Arc::clone(&self.store),
                }))
            })
            .await;

        match initialized {
            Ok(proxy) => Ok(Arc::clone(proxy)),
            Err(e) => {
                if !slot.initialized() {
                    self.forget(key, slot)?;
                }
                debug!(key, error = %e, "Bucket proxy construction failed");
                Err(e)
            }
        }
    }

    // Removes `key` only if it still maps to `slot`
    fn forget(&self, key: &str, slot: &ProxySlot<S>) -> Result<()> {
        let mut proxies = self.proxies.write().map_err(|_| poisoned())?;
        if proxies.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            proxies.remove(key);
        }
        Ok(())
    }

    /// Number of keys with a constructed proxy
    pub fn len(&self) -> usize {
        self.proxies
            .read()
            .map(|proxies| proxies.values().filter(|slot| slot.initialized()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Map entries, including slots whose proxy is still being built
    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.proxies.read().map(|proxies| proxies.len()).unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.proxies
            .read()
            .map(|proxies| proxies.get(key).is_some_and(|slot| slot.initialized()))
            .unwrap_or(false)
    }

    fn slot(&self, key: &str) -> Result<ProxySlot<S>> {
        {
            let proxies = self.proxies.read().map_err(|_| poisoned())?;
            if let Some(slot) = proxies.get(key) {
                return Ok(Arc::clone(slot));
            }
        }

        let mut proxies = self.proxies.write().map_err(|_| poisoned())?;
        Ok(Arc::clone(proxies.entry(key.to_string()).or_default()))
    }
}

impl<S> StatsSource for ProxyCache<S>
where
    S: StorageBackend,
{
    fn estimated_size(&self) -> u64 {
        self.len() as u64
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

fn poisoned() -> RateLimiterError {
    RateLimiterError::Internal("bucket proxy map lock poisoned".to_string())
}
