// src/storage/tests/mod.rs


// Row semantics every backend must honour
pub(crate) mod common {
    use futures::future::join_all;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::bucket::BucketId;
    use crate::error::{RateLimiterError, Result};
    use crate::storage::{RowUpdate, StorageBackend};

    pub async fn test_row_lifecycle<S: StorageBackend>(storage: &S, id: BucketId) -> Result<()> {
        let _ = storage.delete(id).await;

        assert!(storage.load(id).await?.is_none());
        assert!(storage.insert_if_absent(id, b"first").await?);
        assert!(!storage.insert_if_absent(id, b"second").await?);
        assert_eq!(storage.load(id).await?.as_deref(), Some(&b"first"[..]));

        let seen = storage
            .select_for_update(id, |row| {
                let seen = row.map(|bytes| bytes.to_vec());
                Ok(RowUpdate::Write(b"updated".to_vec(), seen))
            })
            .await?;
        assert_eq!(seen.as_deref(), Some(&b"first"[..]));
        assert_eq!(storage.load(id).await?.as_deref(), Some(&b"updated"[..]));

        let kept = storage
            .select_for_update(id, |_| Ok(RowUpdate::Keep(7u32)))
            .await?;
        assert_eq!(kept, 7);
        assert_eq!(storage.load(id).await?.as_deref(), Some(&b"updated"[..]));

        assert!(storage.delete(id).await?);
        assert!(!storage.delete(id).await?);
        Ok(())
    }

    // A failing closure writes nothing and leaves the row lockable
    pub async fn test_failed_mutation_releases_row<S: StorageBackend>(
        storage: &S,
        id: BucketId,
    ) -> Result<()> {
        let _ = storage.delete(id).await;
        storage.insert_if_absent(id, b"kept").await?;

        let failed: Result<()> = storage
            .select_for_update(id, |_| Err(RateLimiterError::Internal("boom".to_string())))
            .await;
        assert!(matches!(failed, Err(RateLimiterError::Internal(_))));
        assert_eq!(storage.load(id).await?.as_deref(), Some(&b"kept"[..]));

        storage
            .select_for_update(id, |_| Ok(RowUpdate::Write(b"after".to_vec(), ())))
            .await?;
        assert_eq!(storage.load(id).await?.as_deref(), Some(&b"after"[..]));

        storage.delete(id).await?;
        Ok(())
    }

    /// Concurrent read-modify-write increments must not lose updates
    pub async fn test_no_lost_updates<S: StorageBackend + 'static>(
        storage: Arc<S>,
        id: BucketId,
        writers: usize,
    ) -> Result<()> {
        let _ = storage.delete(id).await;
        storage.insert_if_absent(id, b"0").await?;

        let tasks = (0..writers).map(|_| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .select_for_update(id, |row| {
                        let current: u64 = row
                            .and_then(|bytes| std::str::from_utf8(bytes).ok())
                            .and_then(|text| text.parse().ok())
                            .unwrap_or(0);
                        let next = current + 1;
                        Ok(RowUpdate::Write(next.to_string().into_bytes(), next))
                    })
                    .await
            })
        });

        for joined in join_all(tasks).await {
            joined.map_err(|e| RateLimiterError::Internal(e.to_string()))??;
        }

        let final_row = storage.load(id).await?.unwrap_or_default();
        assert_eq!(final_row, writers.to_string().into_bytes());

        storage.delete(id).await?;
        Ok(())
    }

    /// A caller dropped mid-update must not keep the row locked.
    ///
    /// Needs a multi-threaded runtime: the holder blocks its worker while
    /// the row is locked.
    pub async fn test_abandoned_caller_releases_row<S: StorageBackend + 'static>(
        storage: Arc<S>,
        id: BucketId,
    ) -> Result<()> {
        let _ = storage.delete(id).await;
        storage.insert_if_absent(id, b"before").await?;

        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
        let abandoned = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .select_for_update(id, move |_| {
                        let _ = locked_tx.send(());
                        std::thread::sleep(Duration::from_millis(100));
                        Ok(RowUpdate::Write(b"after".to_vec(), ()))
                    })
                    .await
            })
        };

        locked_rx
            .await
            .map_err(|e| RateLimiterError::Internal(e.to_string()))?;
        abandoned.abort();
        let _ = abandoned.await;

        // Well inside the lock wait timeout, far from any lease expiry
        let next = storage.select_for_update(id, |row| {
            Ok(RowUpdate::Keep(row.map(|bytes| bytes.to_vec())))
        });
        let seen = tokio::time::timeout(Duration::from_secs(1), next)
            .await
            .map_err(|_| RateLimiterError::Internal("row still locked".to_string()))??;

        // The abandoned update either committed whole or not at all
        assert!(
            seen.as_deref() == Some(&b"after"[..]) || seen.as_deref() == Some(&b"before"[..]),
            "unexpected row contents: {:?}",
            seen
        );

        storage.delete(id).await?;
        Ok(())
    }

    // A deleted row is gone for readers and starts empty for the next writer
    pub async fn test_delete_under_lock<S: StorageBackend>(storage: &S, id: BucketId) -> Result<()> {
        let _ = storage.delete(id).await;
        storage.insert_if_absent(id, b"doomed").await?;

        let deleted = storage
            .select_for_update(id, |row| Ok(RowUpdate::Delete(row.is_some())))
            .await?;
        assert!(deleted);
        assert!(storage.load(id).await?.is_none());

        let seen = storage
            .select_for_update(id, |row| {
                let seen = row.map(|bytes| bytes.to_vec());
                Ok(RowUpdate::Write(b"reborn".to_vec(), seen))
            })
            .await?;
        assert!(seen.is_none());
        assert_eq!(storage.load(id).await?.as_deref(), Some(&b"reborn"[..]));

        storage.delete(id).await?;
        Ok(())
    }
}
