//! # shoal-cache: Bounded data-block cache
//!
//! Memoizes decoded logical blocks, evicts LRU against a soft target and
//! a hard capacity, throttles writers by cache pressure and drives
//! read-ahead from detected access patterns. All background I/O (flushes,
//! prefetches) runs on a bounded worker pool.

mod block;
mod cache;
mod error;
mod oracle;
mod pool;

pub use block::{BlockMode, DataBlock};
pub use cache::{CacheOwner, DataCache, OwnerId, RequestMode};
pub use error::{CacheError, CacheResult};
pub use oracle::{PredictionType, PrefetchOracle};
pub use pool::BackgroundPool;

#[cfg(test)]
mod tests;
