// src/intercept.rs
//! Declarative rate limiting around arbitrary async operations.
//!
//! A [`RateLimit`] names the bucket an operation draws from. A
//! [`RateLimitGuard`] checks that bucket exactly once per call and either runs
//! the operation or fails with [`RateLimiterError::LimitExceeded`] without
//! running it. The operation itself knows nothing about rate limiting.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::RateLimiterError;
use crate::limiter::ApiRateLimiter;
use crate::storage::StorageBackend;

/// Marker attached to an operation: the key of the bucket it consumes from.
///
/// All callers of an operation share its bucket. Use [`scoped`](Self::scoped)
/// to give each caller a bucket of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    key: String,
}

impl RateLimit {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// A narrower limit, `<key>:<scope>`, e.g. per API key or client address.
    ///
    /// Every scope gets its own row. Rows of scopes that have refilled to
    /// capacity are reclaimed when the bucket table runs out of room.
    pub fn scoped(&self, scope: impl fmt::Display) -> Self {
        Self {
            key: format!("{}:{}", self.key, scope),
        }
    }
}

/// Runs operations behind the limiter
#[derive(Debug)]
pub struct RateLimitGuard<S>
where
    S: StorageBackend,
{
    limiter: Arc<ApiRateLimiter<S>>,
}

impl<S> Clone for RateLimitGuard<S>
where
    S: StorageBackend,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<S> RateLimitGuard<S>
where
    S: StorageBackend,
{
    pub fn new(limiter: Arc<ApiRateLimiter<S>>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<ApiRateLimiter<S>> {
        &self.limiter
    }

    /// Consumes one token for `rate_limit`, then runs `op`.
    ///
    /// `op` is not called when the bucket is empty or the check itself fails.
    /// Its output, success or error, is returned unchanged.
    pub async fn around<F, Fut, T, E>(&self, rate_limit: &RateLimit, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RateLimiterError>,
    {
        let probe = self.limiter.check(rate_limit.key()).await?;

        if !probe.consumed {
            debug!(key = rate_limit.key(), "Rejecting call, rate limit exceeded");
            return Err(
                RateLimiterError::limit_exceeded(rate_limit.key(), probe.wait_for_refill).into(),
            );
        }

        op().await
    }

    /// Binds `op` to `rate_limit`, producing a callable that is always guarded
    pub fn wrap<F>(&self, rate_limit: RateLimit, op: F) -> RateLimited<S, F> {
        RateLimited {
            guard: self.clone(),
            rate_limit,
            op,
        }
    }
}

/// An operation permanently decorated with a rate limit
#[derive(Debug)]
pub struct RateLimited<S, F>
where
    S: StorageBackend,
{
    guard: RateLimitGuard<S>,
    rate_limit: RateLimit,
    op: F,
}

impl<S, F> RateLimited<S, F>
where
    S: StorageBackend,
{
    pub fn rate_limit(&self) -> &RateLimit {
        &self.rate_limit
    }

    pub async fn call<A, Fut, T, E>(&self, arg: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RateLimiterError>,
    {
        self.guard
            .around(&self.rate_limit, || (self.op)(arg))
            .await
    }
}
