//! Performance components for the NeuronIP API.
//!
//! - **Query Result Caching**: a TTL cache with LRU eviction at capacity,
//!   pattern-based invalidation, warm-up, and a stoppable background sweep.
//!
//! # Examples
//!
//! ```no_run
//! use neuronip_api::performance::cache::{cached, CacheConfig, CacheError, TtlCache};
//!
//! # async fn example() -> Result<(), CacheError> {
//! let cache = TtlCache::<String>::new(CacheConfig::default());
//!
//! let result = cached(&cache, "catalog:summary", || async {
//!     Ok::<_, CacheError>("expensive summary".to_string())
//! })
//! .await?;
//!
//! assert!(!result.was_cached);
//! # Ok(())
//! # }
//! ```

pub mod cache;

pub use cache::{
    cached, CacheConfig, CacheConfigBuilder, CacheError, CacheStats, CachedResult, TtlCache,
};
