// Cache Layer - key generation, cache-aside reads and entity invalidation
// Every operation fails open: a broken backend degrades to storage reads.

use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::core::Channel;
use crate::error::AppResult;
use crate::infrastructure::traits::CacheBackend;

/// Builds every cache key the crate uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyGenerator {
    prefix: String,
}

impl CacheKeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn for_entity(&self, name: &str, id: impl fmt::Display) -> String {
        format!("{}:entity:{}:{}", self.prefix, name, id)
    }

    pub fn for_channeled_entity(&self, channel: Channel, name: &str, id: impl fmt::Display) -> String {
        format!("{}:channeled:{}:{}:{}", self.prefix, channel.value(), name, id)
    }

    pub fn for_list(&self, name: &str, channel: Option<Channel>, filters: &Value) -> String {
        self.hashed("list", name, channel, filters)
    }

    pub fn for_count(&self, name: &str, channel: Option<Channel>, filters: &Value) -> String {
        self.hashed("count", name, channel, filters)
    }

    fn hashed(&self, kind: &str, name: &str, channel: Option<Channel>, filters: &Value) -> String {
        let scope = channel
            .map(|c| c.value().to_string())
            .unwrap_or_else(|| "all".to_string());
        let digest = Sha256::digest(canonical_json(filters).as_bytes());
        let hash = hex::encode(digest);
        format!("{}:{}:{}:{}:{}", self.prefix, kind, name, scope, &hash[..16])
    }
}

/// JSON text with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                out.push('{');
                for (i, (key, item)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String(key.clone()).to_string());
                    out.push(':');
                    write(item, out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            scalar => out.push_str(&scalar.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// An id as it appears in an invalidation request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheId {
    Int(i64),
    Text(String),
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheId::Int(id) => write!(f, "{}", id),
            CacheId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for CacheId {
    fn from(id: i64) -> Self {
        CacheId::Int(id)
    }
}

impl From<&str> for CacheId {
    fn from(id: &str) -> Self {
        CacheId::Text(id.to_string())
    }
}

/// One id or a list of ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityKeys {
    One(CacheId),
    Many(Vec<CacheId>),
}

impl EntityKeys {
    pub fn ids(&self) -> &[CacheId] {
        match self {
            EntityKeys::One(id) => std::slice::from_ref(id),
            EntityKeys::Many(ids) => ids,
        }
    }
}

impl From<i64> for EntityKeys {
    fn from(id: i64) -> Self {
        EntityKeys::One(CacheId::Int(id))
    }
}

impl From<Vec<i64>> for EntityKeys {
    fn from(ids: Vec<i64>) -> Self {
        EntityKeys::Many(ids.into_iter().map(CacheId::Int).collect())
    }
}

/// Cache metrics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
    pub backend_errors: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
    backend_errors: AtomicU64,
}

/// List/count keys remembered per entity unless configured otherwise
pub const DEFAULT_TRACKED_KEYS_PER_ENTITY: usize = 1024;

/// Cache-aside service over a [`CacheBackend`]
pub struct CacheService {
    backend: Arc<dyn CacheBackend>,
    keys: CacheKeyGenerator,
    default_ttl: Duration,
    /// Entity name to the list/count keys computed for it, least recently
    /// used first out
    tracked: Mutex<HashMap<String, LruCache<String, ()>>>,
    tracked_limit: NonZeroUsize,
    counters: CacheCounters,
}

impl fmt::Debug for CacheService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheService")
            .field("prefix", &self.keys.prefix())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl CacheService {
    pub fn new(backend: Arc<dyn CacheBackend>, keys: CacheKeyGenerator, default_ttl: Duration) -> Self {
        Self {
            backend,
            keys,
            default_ttl,
            tracked: Mutex::new(HashMap::new()),
            tracked_limit: NonZeroUsize::new(DEFAULT_TRACKED_KEYS_PER_ENTITY).unwrap_or(NonZeroUsize::MIN),
            counters: CacheCounters::default(),
        }
    }

    /// Cap the list/count keys remembered per entity. A key pushed out of
    /// the set is deleted from the backend as well, so nothing cached
    /// outlives its invalidation. Zero is treated as one.
    pub fn with_tracked_limit(mut self, limit: usize) -> Self {
        self.tracked_limit = NonZeroUsize::new(limit).unwrap_or(NonZeroUsize::MIN);
        self
    }

    /// Number of list/count keys currently remembered for `entity`
    pub async fn tracked_len(&self, entity: &str) -> usize {
        self.tracked.lock().await.get(entity).map_or(0, LruCache::len)
    }

    pub fn keys(&self) -> &CacheKeyGenerator {
        &self.keys
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Return the cached value for `key`, or compute, store and return it.
    /// Errors from `compute` propagate and nothing is stored; backend errors
    /// never do.
    #[instrument(skip(self, compute, ttl))]
    pub async fn get<T, F, Fut>(&self, key: &str, compute: F, ttl: Option<Duration>) -> AppResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache hit for {}", key);
                    return Ok(value);
                }
                Err(e) => warn!("Discarding undecodable cache entry {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => {
                self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Cache read failed for {}, falling back to storage: {}", key, e);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss for {}", key);
        let value = compute().await?;

        match serde_json::to_vec(&value) {
            Ok(bytes) => match self.backend.put(key, bytes, ttl.unwrap_or(self.default_ttl)).await {
                Ok(()) => {
                    self.counters.writes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Cache write failed for {}: {}", key, e);
                }
            },
            Err(e) => warn!("Could not encode cache entry {}: {}", key, e),
        }
        Ok(value)
    }

    /// Like [`CacheService::get`], additionally recording `key` as a
    /// list/count key of `entity` so that invalidating the entity drops it.
    pub async fn get_tracked<T, F, Fut>(
        &self,
        entity: &str,
        key: &str,
        compute: F,
        ttl: Option<Duration>,
    ) -> AppResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let evicted = {
            let mut tracked = self.tracked.lock().await;
            let limit = self.tracked_limit;
            let keys = tracked
                .entry(entity.to_string())
                .or_insert_with(|| LruCache::new(limit));
            match keys.push(key.to_string(), ()) {
                Some((old, _)) if old != key => Some(old),
                _ => None,
            }
        };
        if let Some(old) = evicted {
            debug!("Forgetting tracked {} key {}", entity, old);
            self.invalidate_keys(&[old]).await;
        }
        self.get(key, compute, ttl).await
    }

    /// Delete the given keys. Failures are logged.
    pub async fn invalidate_keys(&self, keys: &[String]) {
        for key in keys {
            match self.backend.delete(key).await {
                Ok(()) => {
                    self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Cache delete failed for {}: {}", key, e);
                }
            }
        }
    }

    /// Drop the entity keys of every `(name, ids)` pair, the channeled keys
    /// when `channel` is given, and every tracked list/count key of each name.
    ///
    /// The same ids build both key shapes: `for_entity` keys are addressed by
    /// internal id, `for_channeled_entity` keys by platform id. To drop both
    /// for one record, call once with internal ids and no channel, and once
    /// with platform ids and the channel.
    #[instrument(skip(self, entities))]
    pub async fn invalidate_multiple_entities(
        &self,
        entities: &BTreeMap<String, EntityKeys>,
        channel: Option<Channel>,
    ) {
        let mut keys = Vec::new();
        for (name, ids) in entities {
            for id in ids.ids() {
                keys.push(self.keys.for_entity(name, id));
                if let Some(channel) = channel {
                    keys.push(self.keys.for_channeled_entity(channel, name, id));
                }
            }
        }

        {
            let mut tracked = self.tracked.lock().await;
            for name in entities.keys() {
                if let Some(derived) = tracked.remove(name) {
                    keys.extend(derived.into_iter().map(|(key, _)| key));
                }
            }
        }

        debug!("Invalidating {} cache keys", keys.len());
        self.invalidate_keys(&keys).await;
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            backend_errors: self.counters.backend_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::infrastructure::cache::InMemoryCacheBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn service() -> CacheService {
        CacheService::new(
            Arc::new(InMemoryCacheBackend::new(100)),
            CacheKeyGenerator::new("test"),
            Duration::from_secs(60),
        )
    }

    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> AppResult<Option<Vec<u8>>> {
            Err(AppError::CacheError("connection refused".to_string()))
        }

        async fn put(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> AppResult<()> {
            Err(AppError::CacheError("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> AppResult<()> {
            Err(AppError::CacheError("connection refused".to_string()))
        }
    }

    #[test]
    fn test_key_formats() {
        let keys = CacheKeyGenerator::new("commerce");
        assert_eq!(keys.for_entity("Product", 7), "commerce:entity:Product:7");
        assert_eq!(
            keys.for_channeled_entity(Channel::Shopify, "ChanneledProduct", "991"),
            "commerce:channeled:1:ChanneledProduct:991"
        );

        let list = keys.for_list("Product", None, &json!({"sku": "A"}));
        assert!(list.starts_with("commerce:list:Product:all:"));
        assert_eq!(list.rsplit(':').next().map(str::len), Some(16));
        assert!(keys
            .for_count("ChanneledOrder", Some(Channel::Amazon), &json!({}))
            .starts_with("commerce:count:ChanneledOrder:6:"));
    }

    #[test]
    fn test_filter_hash_ignores_key_order() {
        let keys = CacheKeyGenerator::new("commerce");
        let a = keys.for_list("Product", None, &json!({"a": 1, "b": {"y": 2, "x": 1}}));
        let b = keys.for_list("Product", None, &json!({"b": {"x": 1, "y": 2}, "a": 1}));
        let c = keys.for_list("Product", None, &json!({"a": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_get_computes_once_until_invalidated() {
        let cache = service();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(json!({"id": 1, "name": "Mug"}))
        };

        let key = cache.keys().for_entity("Product", 1);
        assert_eq!(cache.get(&key, compute, None).await.unwrap()["name"], json!("Mug"));
        assert_eq!(cache.get(&key, compute, None).await.unwrap()["name"], json!("Mug"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut entities = BTreeMap::new();
        entities.insert("Product".to_string(), EntityKeys::from(vec![1, 2]));
        cache.invalidate_multiple_entities(&entities, None).await;

        cache.get(&key, compute, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.metrics().hits, 1);
        assert_eq!(cache.metrics().misses, 2);
    }

    #[tokio::test]
    async fn test_entries_go_stale_after_ttl() {
        let cache = service();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let compute = move || async move { Ok::<_, AppError>(calls.fetch_add(1, Ordering::SeqCst)) };

        cache.get("k", compute, Some(Duration::from_millis(20))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k", compute, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compute_errors_propagate_and_are_not_cached() {
        let cache = service();
        let err = cache
            .get("k", || async { Err::<i64, _>(AppError::PersistenceError("down".to_string())) }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PersistenceError(_)));
        assert_eq!(cache.get("k", || async { Ok::<_, AppError>(5) }, None).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_broken_backend_fails_open() {
        let cache = CacheService::new(Arc::new(BrokenBackend), CacheKeyGenerator::new("x"), Duration::from_secs(1));
        assert_eq!(cache.get("k", || async { Ok::<_, AppError>(42) }, None).await.unwrap(), 42);

        let mut entities = BTreeMap::new();
        entities.insert("Product".to_string(), EntityKeys::from(1));
        cache.invalidate_multiple_entities(&entities, Some(Channel::Shopify)).await;
        assert!(cache.metrics().backend_errors >= 3);
    }

    #[tokio::test]
    async fn test_undecodable_entries_are_misses() {
        let backend = Arc::new(InMemoryCacheBackend::new(10));
        backend.put("k", b"not json".to_vec(), Duration::from_secs(60)).await.unwrap();
        let cache = CacheService::new(backend, CacheKeyGenerator::new("x"), Duration::from_secs(60));
        assert_eq!(cache.get("k", || async { Ok::<_, AppError>(3) }, None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_tracked_list_keys_drop_with_their_entity() {
        let cache = service();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let compute = move || async move { Ok::<_, AppError>(calls.fetch_add(1, Ordering::SeqCst)) };
        let key = cache.keys().for_count("Vendor", None, &json!({}));

        cache.get_tracked("Vendor", &key, compute, None).await.unwrap();
        cache.get_tracked("Vendor", &key, compute, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut other = BTreeMap::new();
        other.insert("Product".to_string(), EntityKeys::from(1));
        cache.invalidate_multiple_entities(&other, None).await;
        cache.get_tracked("Vendor", &key, compute, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut vendors = BTreeMap::new();
        vendors.insert("Vendor".to_string(), EntityKeys::Many(vec![]));
        cache.invalidate_multiple_entities(&vendors, None).await;
        cache.get_tracked("Vendor", &key, compute, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tracked_keys_are_bounded_per_entity() {
        let cache = CacheService::new(
            Arc::new(InMemoryCacheBackend::new(2)),
            CacheKeyGenerator::new("x"),
            Duration::from_millis(1),
        )
        .with_tracked_limit(2);

        for n in 0..10_000 {
            let key = cache.keys().for_count("Vendor", None, &json!({ "name": n }));
            cache
                .get_tracked("Vendor", &key, move || async move { Ok::<_, AppError>(n) }, None)
                .await
                .unwrap();
        }
        assert_eq!(cache.tracked_len("Vendor").await, 2);
        assert_eq!(cache.tracked_len("Product").await, 0);
    }

    #[tokio::test]
    async fn test_forgotten_tracked_keys_leave_the_backend() {
        let cache = service().with_tracked_limit(1);
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let compute = move || async move { Ok::<_, AppError>(calls.fetch_add(1, Ordering::SeqCst)) };
        let first = cache.keys().for_list("Vendor", None, &json!({"page": 1}));
        let second = cache.keys().for_list("Vendor", None, &json!({"page": 2}));

        cache.get_tracked("Vendor", &first, compute, None).await.unwrap();
        cache.get_tracked("Vendor", &first, compute, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Tracking `second` pushes `first` out of both the set and the backend
        cache.get_tracked("Vendor", &second, compute, None).await.unwrap();
        cache.get(&first, compute, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.tracked_len("Vendor").await, 1);
    }

    #[tokio::test]
    async fn test_channel_invalidation_addresses_platform_ids() {
        let cache = service();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let compute = move || async move { Ok::<_, AppError>(calls.fetch_add(1, Ordering::SeqCst)) };
        let by_id = cache.keys().for_entity("ChanneledOrder", 7);
        let by_platform = cache.keys().for_channeled_entity(Channel::Shopify, "ChanneledOrder", "A-100");
        cache.get(&by_id, compute, None).await.unwrap();
        cache.get(&by_platform, compute, None).await.unwrap();

        let mut internal = BTreeMap::new();
        internal.insert("ChanneledOrder".to_string(), EntityKeys::from(7));
        cache.invalidate_multiple_entities(&internal, None).await;
        let mut platform = BTreeMap::new();
        platform.insert("ChanneledOrder".to_string(), EntityKeys::One(CacheId::from("A-100")));
        cache.invalidate_multiple_entities(&platform, Some(Channel::Shopify)).await;

        cache.get(&by_id, compute, None).await.unwrap();
        cache.get(&by_platform, compute, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_entity_keys_accept_one_or_many() {
        let one: EntityKeys = serde_json::from_value(json!(5)).unwrap();
        let many: EntityKeys = serde_json::from_value(json!([1, "x"])).unwrap();
        assert_eq!(one.ids(), &[CacheId::Int(5)]);
        assert_eq!(many.ids(), &[CacheId::Int(1), CacheId::from("x")]);
    }
}
