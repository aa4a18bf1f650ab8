// src/resilience/mod.rs
//! Behaviour of the limiter when the bucket store is slow or unavailable.
//!
//! 1. **Retry with Exponential Backoff** - pacing of contended row-lock acquisition
//! 2. **Failure Policy** - what a check answers when the store fails

mod exponential_backoff;
mod failure_policy;

#[cfg(test)]
mod tests;

pub use exponential_backoff::{ExponentialBackoff, RetryConfig};
pub use failure_policy::StorageFailurePolicy;
