//! Translation job consumption.
//!
//! - [`queue`]: the Redis list jobs arrive on.
//! - [`consumer`]: the loop that dequeues, translates and notifies.

pub mod consumer;
pub mod queue;

pub use consumer::{Worker, WorkerStats, WorkerStatsSnapshot};
pub use queue::{JobSource, RedisQueue};
