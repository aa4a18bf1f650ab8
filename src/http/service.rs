// src/http/service.rs

use std::sync::Arc;

use crate::error::RateLimiterError;
use crate::intercept::{RateLimit, RateLimitGuard};
use crate::limiter::ApiRateLimiter;
use crate::storage::StorageBackend;

/// Body returned by the guarded demo operations
pub const SUCCESS_MESSAGE: &str = "요청 성공";

pub const RUN1_KEY: &str = "someUniqueKey1";
pub const RUN2_KEY: &str = "someUniqueKey2";

/// Two demo operations, each drawing from its own shared bucket
#[derive(Debug)]
pub struct RateLimitingService<S>
where
    S: StorageBackend,
{
    guard: RateLimitGuard<S>,
    run1_limit: RateLimit,
    run2_limit: RateLimit,
}

impl<S> RateLimitingService<S>
where
    S: StorageBackend,
{
    pub fn new(limiter: Arc<ApiRateLimiter<S>>) -> Self {
        Self {
            guard: RateLimitGuard::new(limiter),
            run1_limit: RateLimit::new(RUN1_KEY),
            run2_limit: RateLimit::new(RUN2_KEY),
        }
    }

    pub fn limiter(&self) -> &Arc<ApiRateLimiter<S>> {
        self.guard.limiter()
    }

    pub async fn run1(&self) -> Result<String, RateLimiterError> {
        self.guard
            .around(&self.run1_limit, || async { Ok(SUCCESS_MESSAGE.to_string()) })
            .await
    }

    pub async fn run2(&self) -> Result<String, RateLimiterError> {
        self.guard
            .around(&self.run2_limit, || async { Ok(SUCCESS_MESSAGE.to_string()) })
            .await
    }
}
