// src/limiter.rs

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::bucket::{BucketPolicy, ConsumptionProbe, PersistentBucketStore, ProxyCache};
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::{RateLimiterError, Result};
use crate::rate_limit_event;
use crate::resilience::StorageFailurePolicy;
use crate::storage::StorageBackend;

/// Entry point of the limiter: one token per call, one bucket per key.
///
/// Safe to share between any number of tasks. Calls for different keys never
/// wait on each other; calls for the same key are ordered by the bucket's row
/// lock in storage, not by this type.
#[derive(Debug)]
pub struct ApiRateLimiter<S>
where
    S: StorageBackend,
{
    proxies: Arc<ProxyCache<S>>,
    on_storage_error: StorageFailurePolicy,
}

impl<S> ApiRateLimiter<S>
where
    S: StorageBackend,
{
    pub fn new(storage: S, config: &LimiterConfig) -> Result<Self> {
        Self::with_clock(storage, config, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: S, config: &LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let policy = config.policy()?;
        let store = Arc::new(PersistentBucketStore::with_clock(storage, clock));
        Ok(Self::from_parts(store, policy, config.on_storage_error))
    }

    pub fn from_parts(
        store: Arc<PersistentBucketStore<S>>,
        policy: BucketPolicy,
        on_storage_error: StorageFailurePolicy,
    ) -> Self {
        Self {
            proxies: Arc::new(ProxyCache::new(store, policy)),
            on_storage_error,
        }
    }

    /// Consumes one token from `key`'s bucket. `Ok(false)` means rate limited.
    pub async fn try_consume(&self, key: &str) -> Result<bool> {
        Ok(self.check(key).await?.consumed)
    }

    /// Consumes one token from `key`'s bucket and reports what is left
    pub async fn check(&self, key: &str) -> Result<ConsumptionProbe> {
        let probe = match self.consume_one(key).await {
            Ok(probe) => probe,
            Err(err) => return self.on_failure(key, err),
        };

        rate_limit_event!(key, probe.consumed, probe.remaining_tokens);
        Ok(probe)
    }

    /// Read-only: an unknown key reports a full bucket and is not created
    pub async fn available_tokens(&self, key: &str) -> Result<u64> {
        self.proxies.available_tokens(key).await
    }

    pub async fn reset(&self, key: &str) -> Result<()> {
        self.proxies.get_or_create_bucket(key).await?.reset().await
    }

    /// Deletes buckets that have refilled to capacity. Returns how many went.
    pub async fn evict_idle(&self) -> Result<usize> {
        self.proxies.evict_idle().await
    }

    pub fn policy(&self) -> &BucketPolicy {
        self.proxies.policy()
    }

    /// The key → bucket proxy cache; it can be registered for statistics
    pub fn proxies(&self) -> &Arc<ProxyCache<S>> {
        &self.proxies
    }

    pub fn failure_policy(&self) -> StorageFailurePolicy {
        self.on_storage_error
    }

    async fn consume_one(&self, key: &str) -> Result<ConsumptionProbe> {
        let proxy = self.proxies.get_or_create_bucket(key).await?;
        proxy.try_consume_and_probe(1).await
    }

    fn on_failure(&self, key: &str, err: RateLimiterError) -> Result<ConsumptionProbe> {
        if !matches!(err, RateLimiterError::Storage(_)) {
            return Err(err);
        }

        match self.on_storage_error.fallback_decision() {
            None => {
                error!(key, error = %err, "Rate limit check failed");
                Err(err)
            }
            Some(allowed) => {
                warn!(
                    key,
                    error = %err,
                    allowed,
                    policy = ?self.on_storage_error,
                    "Rate limit check failed, applying storage failure policy"
                );
                Ok(ConsumptionProbe {
                    consumed: allowed,
                    remaining_tokens: 0,
                    wait_for_refill: if allowed {
                        Duration::ZERO
                    } else {
                        self.policy().refill_interval()
                    },
                })
            }
        }
    }
}
