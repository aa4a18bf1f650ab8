// src/storage/memory.rs

// In-memory bucket table (for tests, single-node deployments and benchmarks).
// Each row owns an async mutex that plays the part of the row lock.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::bucket::BucketId;
use crate::config::InMemoryConfig;
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::{RowUpdate, StorageBackend};
use crate::storage_op;

type Row = Arc<Mutex<Option<Vec<u8>>>>;
type LockedRow = OwnedMutexGuard<Option<Vec<u8>>>;

/// In-memory storage backend implementation
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    rows: Arc<RwLock<HashMap<BucketId, Row>>>,
    config: InMemoryConfig,
}

impl MemoryStorage {
    /// Creates a new in-memory storage with the given configuration
    pub fn new(config: InMemoryConfig) -> Self {
        let rows = Arc::new(RwLock::new(HashMap::with_capacity(
            config.max_entries.min(10_000),
        )));

        Self { rows, config }
    }

    /// Number of rows in the table
    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the lock slot of a row, creating an empty one if needed
    fn row_slot(&self, id: BucketId) -> Result<Row> {
        {
            let rows = self.rows.read().map_err(|_| poisoned())?;
            if let Some(row) = rows.get(&id) {
                return Ok(Arc::clone(row));
            }
        }

        let mut rows = self.rows.write().map_err(|_| poisoned())?;

        // Apply max entries limit
        if rows.len() >= self.config.max_entries && !rows.contains_key(&id) {
            return Err(RateLimiterError::Storage(StorageError::TableFull(
                self.config.max_entries,
            )));
        }

        Ok(Arc::clone(rows.entry(id).or_default()))
    }

    fn existing_slot(&self, id: BucketId) -> Result<Option<Row>> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&id).cloned())
    }

    // A waiter can win the lock of a row that was deleted while it queued
    fn is_registered(&self, id: BucketId, row: &Row) -> Result<bool> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&id).is_some_and(|current| Arc::ptr_eq(current, row)))
    }

    fn unregister(&self, id: BucketId, row: &Row) -> Result<()> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        if rows.get(&id).is_some_and(|current| Arc::ptr_eq(current, row)) {
            rows.remove(&id);
        }
        Ok(())
    }

    async fn lock_row(&self, id: BucketId, row: &Row) -> Result<LockedRow> {
        let started = Instant::now();
        tokio::time::timeout(self.config.lock_wait_timeout, Arc::clone(row).lock_owned())
            .await
            .map_err(|_| {
                RateLimiterError::Storage(StorageError::LockTimeout {
                    bucket_id: id.as_i64(),
                    waited: started.elapsed(),
                })
            })
    }

    /// Locks the row currently registered under `id`, creating it if needed
    async fn lock_current(&self, id: BucketId) -> Result<(Row, LockedRow)> {
        loop {
            let row = self.row_slot(id)?;
            let guard = self.lock_row(id, &row).await?;
            if self.is_registered(id, &row)? {
                return Ok((row, guard));
            }
        }
    }
}

fn poisoned() -> RateLimiterError {
    RateLimiterError::Internal("bucket table lock poisoned".to_string())
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    type Config = InMemoryConfig;

    async fn new(config: Self::Config) -> Result<Self> {
        Ok(Self::new(config))
    }

    async fn insert_if_absent(&self, id: BucketId, state: &[u8]) -> Result<bool> {
        let (_, mut contents) = self.lock_current(id).await?;

        if contents.is_some() {
            return Ok(false);
        }
        *contents = Some(state.to_vec());
        Ok(true)
    }

    async fn select_for_update<T, F>(&self, id: BucketId, mutate: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Option<&[u8]>) -> Result<RowUpdate<T>> + Send + 'static,
    {
        let started = Instant::now();
        let (row, mut contents) = self.lock_current(id).await?;

        // The guard drops on every path below, releasing the row
        let result = match mutate(contents.as_deref()) {
            Ok(RowUpdate::Write(bytes, value)) => {
                *contents = Some(bytes);
                Ok(value)
            }
            Ok(RowUpdate::Keep(value)) => Ok(value),
            Ok(RowUpdate::Delete(value)) => {
                *contents = None;
                self.unregister(id, &row).map(|_| value)
            }
            Err(e) => Err(e),
        };

        storage_op!(
            "select_for_update",
            id.as_i64(),
            result,
            started.elapsed().as_millis() as u64
        );
        result
    }

    async fn load(&self, id: BucketId) -> Result<Option<Vec<u8>>> {
        match self.existing_slot(id)? {
            Some(row) => {
                let contents = self.lock_row(id, &row).await?;
                Ok(contents.clone())
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: BucketId) -> Result<bool> {
        let removed = {
            let mut rows = self.rows.write().map_err(|_| poisoned())?;
            rows.remove(&id)
        };

        match removed {
            Some(row) => Ok(row.lock().await.take().is_some()),
            None => Ok(false),
        }
    }
}
