//! Sorted-set storage substrate
//!
//! [`SetStore`] is the contract the engine needs from its backing service
//! (Redis semantics: ZADD, ZREM, ZREVRANGEBYSCORE, ZREMRANGEBYRANK, ...).
//! Every method is one independent round trip; only [`SetStore::atomic_update`]
//! groups reads and writes atomically.
//!
//! Implementations:
//! - `InMemorySetStore`: in-process store for tests and single-node use

mod memory;
mod sorted_set;

pub use memory::InMemorySetStore;
pub use sorted_set::{ScoreBound, SortedSet};

use std::sync::Arc;
use std::time::Duration;

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Key holds a value of another type
    WrongType { key: String },
    /// INCR on a value that is not an integer
    NotInteger { key: String },
    /// Backing service unreachable or failed
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::WrongType { key } => write!(
                f,
                "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
                key
            ),
            StoreError::NotInteger { key } => {
                write!(f, "ERR value is not an integer or out of range: {}", key)
            }
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Sorted-set key/value store contract
pub trait SetStore: Send + Sync + 'static {
    /// Insert or update `member`. Returns true if the member is new.
    fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool>;

    /// Insert `member`, or raise its score when `score` is greater.
    /// Returns true if anything changed.
    fn zadd_gt(&self, key: &str, score: f64, member: &str) -> StoreResult<bool>;

    fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    fn zcard(&self, key: &str) -> StoreResult<usize>;

    /// Members by descending rank, `[start, stop]` inclusive, negative
    /// indices counting from the end
    fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, f64)>>;

    /// Members with `min <= score <= max`, highest score first
    fn zrevrangebyscore(
        &self,
        key: &str,
        max: ScoreBound,
        min: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Remove members by ascending rank. Returns the number removed.
    fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> StoreResult<usize>;

    fn del(&self, key: &str) -> StoreResult<bool>;

    fn incrby(&self, key: &str, delta: i64) -> StoreResult<i64>;

    fn incr(&self, key: &str) -> StoreResult<i64> {
        self.incrby(key, 1)
    }

    /// Set a time-to-live on an existing key. Returns false if the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Live keys starting with `prefix`, sorted (KEYS `prefix*`)
    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Read-modify-write the sorted sets at `keys` as one atomic step.
    ///
    /// `op` receives the sets in the order of `keys` (empty sets for absent
    /// keys); sets left empty are deleted.
    fn atomic_update(
        &self,
        keys: &[String],
        op: &mut dyn FnMut(&mut [SortedSet]),
    ) -> StoreResult<()>;

    /// Physically remove keys whose TTL has passed. Returns the number
    /// removed. Stores that expire keys on their own return 0.
    fn evict_expired(&self) -> usize {
        0
    }
}

pub type SharedStore = Arc<dyn SetStore>;
