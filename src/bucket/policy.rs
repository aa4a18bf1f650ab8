// src/bucket/policy.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RateLimiterError, Result};

/// Immutable rate limit shared by every bucket of one limiter.
///
/// Refill is *intervally*: nothing trickles in between intervals. Once per
/// whole elapsed `refill_interval`, `refill_amount` tokens are added in one
/// step, capped at `capacity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPolicy {
    capacity: u64,
    refill_amount: u64,
    refill_interval_ms: u64,
}

impl BucketPolicy {
    pub fn builder() -> BucketPolicyBuilder {
        BucketPolicyBuilder::default()
    }

    /// `capacity` tokens, refilled to full once per `interval`
    pub fn refill_to_capacity(capacity: u64, interval: Duration) -> Result<Self> {
        Self::builder()
            .capacity(capacity)
            .refill_intervally(capacity, interval)
            .build()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_amount(&self) -> u64 {
        self.refill_amount
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    pub fn refill_interval_millis(&self) -> u64 {
        self.refill_interval_ms
    }
}

/// Builder for [`BucketPolicy`]; `build` rejects zero values
#[derive(Debug, Default, Clone)]
pub struct BucketPolicyBuilder {
    capacity: Option<u64>,
    refill: Option<(u64, Duration)>,
}

impl BucketPolicyBuilder {
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Add `amount` tokens once per elapsed `interval`
    pub fn refill_intervally(mut self, amount: u64, interval: Duration) -> Self {
        self.refill = Some((amount, interval));
        self
    }

    pub fn build(self) -> Result<BucketPolicy> {
        let capacity = self
            .capacity
            .ok_or_else(|| RateLimiterError::Config("bucket capacity is not set".to_string()))?;
        let (refill_amount, interval) = self
            .refill
            .ok_or_else(|| RateLimiterError::Config("bucket refill is not set".to_string()))?;

        if capacity == 0 {
            return Err(RateLimiterError::Config(
                "bucket capacity must be greater than zero".to_string(),
            ));
        }
        if refill_amount == 0 {
            return Err(RateLimiterError::Config(
                "refill amount must be greater than zero".to_string(),
            ));
        }

        let refill_interval_ms = interval.as_millis() as u64;
        if refill_interval_ms == 0 {
            return Err(RateLimiterError::Config(format!(
                "refill interval must be at least 1ms, got {:?}",
                interval
            )));
        }

        if refill_amount > capacity {
            tracing::warn!(
                capacity,
                refill_amount,
                "refill amount exceeds capacity; refills will be capped"
            );
        }

        Ok(BucketPolicy {
            capacity,
            refill_amount,
            refill_interval_ms,
        })
    }
}
