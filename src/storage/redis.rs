// src/storage/redis.rs

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

use crate::bucket::BucketId;
use crate::config::RedisConfig;
use crate::error::{RateLimiterError, Result, StorageError};
use crate::resilience::{ExponentialBackoff, RetryConfig};
use crate::storage::{RowUpdate, StorageBackend};
use crate::storage_op;

// Writes the row only while the caller still owns the lock lease.
// KEYS: lock, row. ARGV: token, id column, id, state column, state.
const COMMIT_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('HSET', KEYS[2], ARGV[2], ARGV[3], ARGV[4], ARGV[5])
    return 1
end
return 0
"#;

// Deletes the row only while the caller still owns the lock lease.
// KEYS: lock, row. ARGV: token.
const DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[2])
    return 1
end
return 0
"#;

// Deletes the lock only if it is still ours.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Bucket table kept in Redis.
///
/// Row `<table>:<id>` is a hash with the id and state columns. The row lock is
/// a lease key `<table>:<id>:lock` holding a random owner token, taken with
/// `SET NX PX` so that a crashed holder frees the row once the lease runs out.
pub struct RedisStorage {
    connection: Arc<tokio::sync::Mutex<ConnectionManager>>,
    config: RedisConfig,
    commit_script: Script,
    delete_script: Script,
    release_script: Script,
}

// Manually implement Debug
impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("url", &self.config.url)
            .field("table", &self.config.table.table)
            .field("lock_wait", &self.config.lock.wait_timeout)
            .finish()
    }
}

// Manually implement Clone
impl Clone for RedisStorage {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            config: self.config.clone(),
            commit_script: self.commit_script.clone(),
            delete_script: self.delete_script.clone(),
            release_script: self.release_script.clone(),
        }
    }
}

impl RedisStorage {
    /// Creates a new Redis storage with the given configuration
    pub async fn new(config: RedisConfig) -> Result<Self> {
        // Open the client - this doesn't actually connect to Redis yet
        let client = Client::open(config.url.as_str())
            .map_err(|e| RateLimiterError::Storage(StorageError::RedisConnection(e.to_string())))?;

        let connection_future = ConnectionManager::new(client.clone());

        let connection_manager =
            match tokio::time::timeout(config.connection_timeout, connection_future).await {
                Ok(result) => result.map_err(|e| {
                    RateLimiterError::Storage(StorageError::RedisConnection(e.to_string()))
                })?,
                Err(_) => {
                    return Err(RateLimiterError::Storage(StorageError::RedisConnection(
                        format!(
                            "Connection to Redis at {} timed out after {:?}",
                            config.url, config.connection_timeout
                        ),
                    )));
                }
            };

        Ok(Self {
            connection: Arc::new(tokio::sync::Mutex::new(connection_manager)),
            config,
            commit_script: Script::new(COMMIT_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    /// Ping Redis to check health with timeout
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.lock().await;

        let ping_future = redis::AsyncCommands::ping::<String>(&mut *conn);

        let result = match tokio::time::timeout(self.config.connection_timeout, ping_future).await {
            Ok(inner_result) => inner_result.map_err(|e| {
                RateLimiterError::Storage(StorageError::RedisCommand(e.to_string()))
            })?,
            Err(_) => {
                return Err(RateLimiterError::Storage(StorageError::RedisCommand(
                    format!(
                        "Redis PING operation timed out after {:?}",
                        self.config.connection_timeout
                    ),
                )));
            }
        };

        if result == "PONG" {
            Ok(())
        } else {
            Err(RateLimiterError::Storage(StorageError::RedisCommand(
                format!("Unexpected response from Redis PING: {}", result),
            )))
        }
    }

    fn row_key(&self, id: BucketId) -> String {
        format!("{}:{}", self.config.table.table, id)
    }

    fn lock_key(&self, id: BucketId) -> String {
        format!("{}:{}:lock", self.config.table.table, id)
    }

    /// Takes the row lock, retrying with backoff until the wait timeout.
    /// Returns the owner token needed to commit and release.
    async fn acquire_lock(&self, id: BucketId) -> Result<String> {
        let lock_key = self.lock_key(id);
        let token = Uuid::new_v4().to_string();
        let lease_ms = self.config.lock.lease.as_millis() as u64;

        let started = Instant::now();
        let deadline = started + self.config.lock.wait_timeout;
        let mut backoff = ExponentialBackoff::new(RetryConfig::for_lock(&self.config.lock));

        loop {
            let acquired: Option<String> = {
                let mut conn = self.connection.lock().await;
                redis::cmd("SET")
                    .arg(&lock_key)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(lease_ms)
                    .query_async(&mut *conn)
                    .await?
            };

            if acquired.is_some() {
                return Ok(token);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RateLimiterError::Storage(StorageError::LockTimeout {
                    bucket_id: id.as_i64(),
                    waited: now - started,
                }));
            }

            let pause = backoff
                .next_backoff()
                .unwrap_or(self.config.lock.max_backoff)
                .min(deadline - now);
            tokio::time::sleep(pause.max(Duration::from_millis(1))).await;
        }
    }

    async fn release_lock(&self, id: BucketId, token: &str) -> Result<()> {
        let mut conn = self.connection.lock().await;
        let _: i64 = self
            .release_script
            .key(self.lock_key(id))
            .arg(token)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    /// Read, compute and commit while holding the lock identified by `token`
    async fn update_locked<T, F>(&self, id: BucketId, token: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(Option<&[u8]>) -> Result<RowUpdate<T>>,
    {
        let row_key = self.row_key(id);

        let current: Option<Vec<u8>> = {
            let mut conn = self.connection.lock().await;
            redis::cmd("HGET")
                .arg(&row_key)
                .arg(&self.config.table.state_column)
                .query_async(&mut *conn)
                .await?
        };

        let committed: i64 = match mutate(current.as_deref())? {
            RowUpdate::Keep(value) => return Ok(value),
            RowUpdate::Write(bytes, value) => {
                let mut conn = self.connection.lock().await;
                let committed = self
                    .commit_script
                    .key(self.lock_key(id))
                    .key(&row_key)
                    .arg(token)
                    .arg(&self.config.table.id_column)
                    .arg(id.as_i64())
                    .arg(&self.config.table.state_column)
                    .arg(bytes)
                    .invoke_async(&mut *conn)
                    .await?;
                if committed == 1 {
                    return Ok(value);
                }
                committed
            }
            RowUpdate::Delete(value) => {
                let mut conn = self.connection.lock().await;
                let committed = self
                    .delete_script
                    .key(self.lock_key(id))
                    .key(&row_key)
                    .arg(token)
                    .invoke_async(&mut *conn)
                    .await?;
                if committed == 1 {
                    return Ok(value);
                }
                committed
            }
        };

        warn!(bucket_id = id.as_i64(), committed, "bucket row lease expired before commit");
        Err(RateLimiterError::Storage(StorageError::LockLost {
            bucket_id: id.as_i64(),
        }))
    }

    /// Acquire, read-modify-write and release, start to finish
    async fn locked_section<T, F>(&self, id: BucketId, mutate: F) -> Result<T>
    where
        F: FnOnce(Option<&[u8]>) -> Result<RowUpdate<T>>,
    {
        let token = self.acquire_lock(id).await?;

        let result = self.update_locked(id, &token, mutate).await;

        // Release on every path; an expired lease has already freed the row
        if let Err(e) = self.release_lock(id, &token).await {
            warn!(bucket_id = id.as_i64(), error = %e, "failed to release bucket row lock");
        }
        result
    }
}

#[async_trait]
impl StorageBackend for RedisStorage {
    type Config = RedisConfig;

    async fn new(config: Self::Config) -> Result<Self> {
        Self::new(config).await
    }

    async fn insert_if_absent(&self, id: BucketId, state: &[u8]) -> Result<bool> {
        let row_key = self.row_key(id);
        let mut conn = self.connection.lock().await;

        let (inserted, _): (bool, bool) = redis::pipe()
            .atomic()
            .cmd("HSETNX")
            .arg(&row_key)
            .arg(&self.config.table.state_column)
            .arg(state)
            .cmd("HSETNX")
            .arg(&row_key)
            .arg(&self.config.table.id_column)
            .arg(id.as_i64())
            .query_async(&mut *conn)
            .await?;

        Ok(inserted)
    }

    async fn select_for_update<T, F>(&self, id: BucketId, mutate: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Option<&[u8]>) -> Result<RowUpdate<T>> + Send + 'static,
    {
        let started = Instant::now();

        // Runs detached from the caller: dropping the caller's future must not
        // leave the lease held until it expires
        let storage = self.clone();
        let result = tokio::spawn(async move { storage.locked_section(id, mutate).await })
            .await
            .map_err(|e| RateLimiterError::Internal(format!("bucket row task failed: {}", e)))
            .and_then(|result| result);

        storage_op!(
            "select_for_update",
            id.as_i64(),
            result,
            started.elapsed().as_millis() as u64
        );
        result
    }

    async fn load(&self, id: BucketId) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.lock().await;
        let result: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(self.row_key(id))
            .arg(&self.config.table.state_column)
            .query_async(&mut *conn)
            .await?;

        Ok(result)
    }

    async fn delete(&self, id: BucketId) -> Result<bool> {
        let mut conn = self.connection.lock().await;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.row_key(id))
            .query_async(&mut *conn)
            .await?;

        Ok(removed > 0)
    }
}
