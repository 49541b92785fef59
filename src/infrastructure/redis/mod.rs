//! Redis plumbing shared by the broker and presence backends.
//!
//! - `RedisPool`: multiplexed command connection with lazy reconnect
//! - `ExponentialBackoff`: delays for subscribe/publish/presence retries

mod backoff;
pub mod pool;

pub use backoff::{retry_with_backoff, BackoffConfig, ExponentialBackoff};
pub use pool::{PoolError, RedisPool};
