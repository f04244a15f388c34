//! Shared utilities for writing deterministic dataplane test runners.
//!
//! Nothing in here knows about test catalogs or dataplanes. Runners compose
//! these pieces: shard a resolved list, order it, bound each test with a
//! cooperative deadline, and serialize the outcome.

mod order;
pub mod report;
mod shard;
mod timeout;

pub use order::{apply_order, TestOrder, DEFAULT_ORDER_SEED};
pub use shard::{apply_shard, ShardSpec};
pub use timeout::{CancelToken, Cancelled, TimeoutError, TimeoutGuard, TimeoutManager};
