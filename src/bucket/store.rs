// src/bucket/store.rs

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::bucket::{BucketId, BucketPolicy, BucketState, ConsumptionProbe};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::storage::{RowUpdate, StorageBackend};

/// Binds a bucket row to the policy its state is computed under
#[derive(Debug, Clone)]
pub struct BucketHandle {
    bucket_id: BucketId,
    policy: Arc<BucketPolicy>,
}

impl BucketHandle {
    pub fn bucket_id(&self) -> BucketId {
        self.bucket_id
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }
}

/// Durable token buckets, one row each, shared by every process using the same storage.
///
/// All state changes happen inside [`StorageBackend::select_for_update`], so
/// concurrent consumers of one bucket, in this process or another, are
/// serialized by the row lock. The clock is read after the lock is taken.
#[derive(Debug)]
pub struct PersistentBucketStore<S>
where
    S: StorageBackend,
{
    storage: S,
    clock: Arc<dyn Clock>,
}

impl<S> PersistentBucketStore<S>
where
    S: StorageBackend,
{
    pub fn new(storage: S) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: S, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Returns a handle to the bucket's row, inserting a full bucket if the row is missing
    pub async fn get_or_create(
        &self,
        bucket_id: BucketId,
        policy: Arc<BucketPolicy>,
    ) -> Result<BucketHandle> {
        let initial = BucketState::full(&policy, self.clock.now_millis()).encode()?;
        let created = self.storage.insert_if_absent(bucket_id, &initial).await?;

        debug!(
            bucket_id = bucket_id.as_i64(),
            created,
            capacity = policy.capacity(),
            "Bucket row ready"
        );

        Ok(BucketHandle { bucket_id, policy })
    }

    /// Handle to a bucket row without touching storage
    pub fn handle(&self, bucket_id: BucketId, policy: Arc<BucketPolicy>) -> BucketHandle {
        BucketHandle { bucket_id, policy }
    }

    /// Takes `tokens` from the bucket if available
    pub async fn try_consume(&self, handle: &BucketHandle, tokens: u64) -> Result<bool> {
        Ok(self.try_consume_and_probe(handle, tokens).await?.consumed)
    }

    /// Like [`try_consume`](Self::try_consume), also reporting what is left
    pub async fn try_consume_and_probe(
        &self,
        handle: &BucketHandle,
        tokens: u64,
    ) -> Result<ConsumptionProbe> {
        let policy = Arc::clone(&handle.policy);
        let clock = Arc::clone(&self.clock);

        self.storage
            .select_for_update(handle.bucket_id, move |row| {
                let now = clock.now_millis();
                let mut state = current_state(row, &policy, now)?;
                let before = state;

                let consumed = state.try_consume(&policy, now, tokens);
                let probe = ConsumptionProbe {
                    consumed,
                    remaining_tokens: state.tokens,
                    wait_for_refill: if consumed {
                        Duration::ZERO
                    } else {
                        state.until_next_refill(&policy, now)
                    },
                };

                if row.is_some() && state == before {
                    Ok(RowUpdate::Keep(probe))
                } else {
                    Ok(RowUpdate::Write(state.encode()?, probe))
                }
            })
            .await
    }

    /// Tokens the bucket would hold right now. Reads without locking and writes nothing.
    pub async fn available_tokens(&self, handle: &BucketHandle) -> Result<u64> {
        let now = self.clock.now_millis();
        let row = self.storage.load(handle.bucket_id).await?;
        let mut state = current_state(row.as_deref(), &handle.policy, now)?;
        state.refill(&handle.policy, now);
        Ok(state.tokens)
    }

    /// Refills the bucket to capacity and restarts its refill interval
    pub async fn reset(&self, handle: &BucketHandle) -> Result<()> {
        let policy = Arc::clone(&handle.policy);
        let clock = Arc::clone(&self.clock);

        self.storage
            .select_for_update(handle.bucket_id, move |_| {
                let state = BucketState::full(&policy, clock.now_millis());
                Ok(RowUpdate::Write(state.encode()?, ()))
            })
            .await
    }

    /// Deletes the bucket's row if it has refilled to capacity.
    ///
    /// A full bucket is indistinguishable from a freshly created one, so the
    /// row can go without losing any limit state. Returns whether it was deleted.
    pub async fn remove_if_full(&self, handle: &BucketHandle) -> Result<bool> {
        let policy = Arc::clone(&handle.policy);
        let clock = Arc::clone(&self.clock);

        self.storage
            .select_for_update(handle.bucket_id, move |row| {
                let Some(bytes) = row else {
                    return Ok(RowUpdate::Keep(false));
                };
                let now = clock.now_millis();
                let mut state = current_state(Some(bytes), &policy, now)?;
                state.refill(&policy, now);

                if state.tokens >= policy.capacity() {
                    Ok(RowUpdate::Delete(true))
                } else {
                    Ok(RowUpdate::Keep(false))
                }
            })
            .await
    }
}

// A row purged while its proxy was cached starts over as a full bucket
fn current_state(row: Option<&[u8]>, policy: &BucketPolicy, now_ms: u64) -> Result<BucketState> {
    match row {
        Some(bytes) => {
            let mut state = BucketState::decode(bytes)?;
            state.clamp_to(policy);
            Ok(state)
        }
        None => Ok(BucketState::full(policy, now_ms)),
    }
}
