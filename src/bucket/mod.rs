// src/bucket/mod.rs
//! Token buckets persisted one row per bucket, and the in-process proxies that front them.

mod key;
mod policy;
mod proxy;
mod state;
mod store;

#[cfg(test)]
mod tests;

pub use key::BucketId;
pub use policy::{BucketPolicy, BucketPolicyBuilder};
pub use proxy::{BucketProxy, ProxyCache};
pub use state::{BucketState, ConsumptionProbe};
pub use store::{BucketHandle, PersistentBucketStore};
