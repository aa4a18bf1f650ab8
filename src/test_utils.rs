// src/test_utils.rs

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bucket::BucketId;
use crate::clock::ManualClock;
use crate::config::{InMemoryConfig, LimiterConfig};
use crate::error::{RateLimiterError, Result, StorageError};
use crate::limiter::ApiRateLimiter;
use crate::resilience::StorageFailurePolicy;
use crate::storage::{MemoryStorage, RowUpdate, StorageBackend};

/// Start of every manual clock in tests: 2024-01-01T00:00:00Z
pub const T0: u64 = 1_704_067_200_000;

/// In-memory storage that counts calls and can be told to fail or stall
#[derive(Debug, Clone)]
pub struct MockStorage {
    inner: MemoryStorage,
    inserts: Arc<AtomicUsize>,
    updates: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    insert_delay_ms: Arc<AtomicU64>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            inner: MemoryStorage::new(config),
            inserts: Arc::new(AtomicUsize::new(0)),
            updates: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
            insert_delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of `insert_if_absent` calls so far
    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Number of `select_for_update` calls so far
    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// While set, every call fails with a connection error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes `insert_if_absent` sleep before touching the table
    pub fn set_insert_delay(&self, delay: Duration) {
        self.insert_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn rows(&self) -> &MemoryStorage {
        &self.inner
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RateLimiterError::Storage(StorageError::RedisConnection(
                "connection refused".to_string(),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MockStorage {
    type Config = InMemoryConfig;

    async fn new(config: Self::Config) -> Result<Self> {
        Ok(Self::with_config(config))
    }

    async fn insert_if_absent(&self, id: BucketId, state: &[u8]) -> Result<bool> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let delay = self.insert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check()?;
        self.inner.insert_if_absent(id, state).await
    }

    async fn select_for_update<T, F>(&self, id: BucketId, mutate: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Option<&[u8]>) -> Result<RowUpdate<T>> + Send + 'static,
    {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.select_for_update(id, mutate).await
    }

    async fn load(&self, id: BucketId) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.inner.load(id).await
    }

    async fn delete(&self, id: BucketId) -> Result<bool> {
        self.check()?;
        self.inner.delete(id).await
    }
}

/// Limiter settings used throughout the tests: 3 tokens, +3 every 5 seconds
pub fn test_limiter_config() -> LimiterConfig {
    LimiterConfig {
        capacity: 3,
        refill_amount: 3,
        refill_interval: Duration::from_secs(5),
        on_storage_error: StorageFailurePolicy::Propagate,
    }
}

/// A limiter over a fresh [`MockStorage`] with a manual clock at [`T0`]
pub fn create_test_limiter(
    config: &LimiterConfig,
) -> (Arc<ApiRateLimiter<MockStorage>>, MockStorage, Arc<ManualClock>) {
    let storage = MockStorage::new();
    let clock = Arc::new(ManualClock::new(T0));
    let limiter = ApiRateLimiter::with_clock(storage.clone(), config, clock.clone())
        .unwrap_or_else(|e| panic!("test limiter config rejected: {}", e));
    (Arc::new(limiter), storage, clock)
}
