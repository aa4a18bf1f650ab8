// src/storage/mod.rs

pub mod memory;
pub mod redis;

#[cfg(test)]
mod tests;

pub use memory::MemoryStorage;
pub use redis::RedisStorage;

use super::bucket::BucketId;
use super::error::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Outcome of a locked read-modify-write on a bucket row
#[derive(Debug)]
pub enum RowUpdate<T> {
    /// Replace the row contents with the given bytes, then return the value
    Write(Vec<u8>, T),
    /// Leave the row untouched and return the value
    Keep(T),
    /// Remove the row before unlocking, then return the value
    Delete(T),
}

/// A table holding one row per bucket: `(bucket id, serialized state)`.
///
/// Every mutation of an existing row goes through [`select_for_update`],
/// which holds an exclusive row lock across read, compute and write. The
/// lock is released on every path, including when `mutate` fails and when
/// the calling future is dropped before it completes.
///
/// [`select_for_update`]: StorageBackend::select_for_update
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    // The type of configuration this storage backend accepts
    type Config: Send + Sync;

    // Creates a new instance of this storage backend with the given configuration
    async fn new(config: Self::Config) -> Result<Self>
    where
        Self: Sized;

    /// Inserts the row unless one already exists. Returns whether it was inserted.
    async fn insert_if_absent(&self, id: BucketId, state: &[u8]) -> Result<bool>;

    /// Locks the row, hands its current contents (if any) to `mutate`, and
    /// persists the replacement `mutate` asks for before unlocking.
    async fn select_for_update<T, F>(&self, id: BucketId, mutate: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Option<&[u8]>) -> Result<RowUpdate<T>> + Send + 'static;

    /// Reads the last committed contents of a row. Never takes the row lock for writing.
    async fn load(&self, id: BucketId) -> Result<Option<Vec<u8>>>;

    /// Deletes a row. Bucket rows are only ever purged from outside the limiter.
    async fn delete(&self, id: BucketId) -> Result<bool>;
}
