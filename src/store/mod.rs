//! The bounded, concurrency-safe eviction store.

pub mod lru;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("capacity must be at least 1")]
    InvalidCapacity,
    #[error("unknown eviction policy '{0}'")]
    UnknownPolicy(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The capability set every eviction store implementation exposes.
///
/// Kept as a trait (rather than hardcoding `LruStore` everywhere) so a
/// second eviction policy can be added later without touching callers that
/// only need these operations — the `node`/`client` modules hold
/// `Arc<dyn Store>`. Recovery, which needs exclusive-lock semantics beyond
/// this capability set, is implemented against the concrete `LruStore`
/// rather than through this trait.
pub trait Store: Send + Sync {
    fn set(&self, key: String, value: String);
    fn get(&self, key: &str) -> Option<String>;
    fn delete(&self, key: &str) -> bool;
    fn flush(&self);
    fn keys(&self) -> Vec<String>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Construct a store for the given policy name, matching the original
/// Go `NewCache(cacheType, capacity)` factory's case-insensitive switch.
pub fn new_store(policy: &str, capacity: usize) -> Result<std::sync::Arc<lru::LruStore>> {
    if capacity < 1 {
        return Err(StoreError::InvalidCapacity);
    }
    match policy.to_ascii_uppercase().as_str() {
        "LRU" => Ok(std::sync::Arc::new(lru::LruStore::new(capacity))),
        other => Err(StoreError::UnknownPolicy(other.to_string())),
    }
}
