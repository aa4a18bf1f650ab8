use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::RateLimiterError;

/// Answer of the rate limiter when the bucket store cannot be reached.
///
/// The default is to hand the storage error to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFailurePolicy {
    /// Return the storage error to the caller
    #[default]
    Propagate,
    /// Treat the check as allowed
    FailOpen,
    /// Treat the check as rejected
    FailClosed,
}

impl StorageFailurePolicy {
    /// The decision to substitute for a failed check, or `None` to propagate the error
    pub fn fallback_decision(self) -> Option<bool> {
        match self {
            StorageFailurePolicy::Propagate => None,
            StorageFailurePolicy::FailOpen => Some(true),
            StorageFailurePolicy::FailClosed => Some(false),
        }
    }
}

impl FromStr for StorageFailurePolicy {
    type Err = RateLimiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "propagate" => Ok(StorageFailurePolicy::Propagate),
            "fail_open" => Ok(StorageFailurePolicy::FailOpen),
            "fail_closed" => Ok(StorageFailurePolicy::FailClosed),
            other => Err(RateLimiterError::Config(format!(
                "unknown storage failure policy '{}', expected propagate, fail_open or fail_closed",
                other
            ))),
        }
    }
}
