// Core infrastructure modules
pub mod cache;           // In-memory LRU/TTL cache backend
pub mod cache_decorator; // Cache-aside repository decorator
pub mod cache_layer;     // Key generation, cache service, invalidation
pub mod database;        // SQLite storage
pub mod traits;          // Infrastructure traits

pub use cache::{CacheEntry, InMemoryCacheBackend};
pub use cache_decorator::CachedRepository;
pub use cache_layer::{CacheId, CacheKeyGenerator, CacheMetrics, CacheService, EntityKeys};
pub use database::Database;
pub use traits::CacheBackend;
