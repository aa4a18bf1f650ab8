// src/bucket/state.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::bucket::BucketPolicy;
use crate::error::Result;

/// Persisted state of one token bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available
    pub tokens: u64,
    /// Start of the current refill interval, milliseconds since the Unix epoch
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A bucket holding `capacity` tokens, its first interval starting at `now_ms`
    pub fn full(policy: &BucketPolicy, now_ms: u64) -> Self {
        Self {
            tokens: policy.capacity(),
            last_refill_ms: now_ms,
        }
    }

    /// Adds `refill_amount` once per whole interval elapsed since the last refill.
    ///
    /// The refill timestamp advances by whole intervals only, so a partially
    /// elapsed interval keeps counting toward the next refill. A clock that
    /// moved backwards refills nothing.
    pub fn refill(&mut self, policy: &BucketPolicy, now_ms: u64) {
        let interval = policy.refill_interval_millis();
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        let periods = elapsed / interval;
        if periods == 0 {
            return;
        }

        let added = periods.saturating_mul(policy.refill_amount());
        self.tokens = self.tokens.saturating_add(added).min(policy.capacity());
        self.last_refill_ms = self
            .last_refill_ms
            .saturating_add(periods.saturating_mul(interval));
    }

    /// Refills, then takes `tokens` if that many are available
    pub fn try_consume(&mut self, policy: &BucketPolicy, now_ms: u64, tokens: u64) -> bool {
        self.refill(policy, now_ms);
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Time until the next refill step lands, measured from `now_ms`
    pub fn until_next_refill(&self, policy: &BucketPolicy, now_ms: u64) -> Duration {
        let interval = policy.refill_interval_millis();
        let elapsed = now_ms.saturating_sub(self.last_refill_ms) % interval;
        Duration::from_millis(interval - elapsed)
    }

    /// Clamp tokens to capacity; a row written under a larger policy may hold more
    pub fn clamp_to(&mut self, policy: &BucketPolicy) {
        self.tokens = self.tokens.min(policy.capacity());
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Result of one consumption attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionProbe {
    /// Whether the tokens were taken
    pub consumed: bool,
    /// Tokens left in the bucket after the attempt
    pub remaining_tokens: u64,
    /// Time until the next refill step; zero when the attempt succeeded
    pub wait_for_refill: Duration,
}
