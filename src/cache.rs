use moka::sync::Cache;
use std::hash::Hash;
use std::time::Duration;

/// Thin wrapper over a bounded in-process cache. The template engine keys
/// compiled templates by name here; anything cheap to clone fits.
pub struct CacheManager<K, V>
where
    K: Clone + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<K, V>,
}

impl<K, V> CacheManager<K, V>
where
    K: Clone + Eq + Send + Sync + Hash + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    /// Unbounded lifetime variant; entries only fall out by capacity.
    pub fn unexpiring(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key)
    }

    pub fn set(&self, key: K, value: V) {
        self.cache.insert(key, value);
    }

    pub fn remove(&self, key: &K) {
        self.cache.invalidate(key);
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

// Helper type for JSON caching
pub type JsonCache<K> = CacheManager<K, serde_json::Value>;

// Default configuration
pub fn default_cache<K, V>(max_capacity: u64) -> CacheManager<K, V>
where
    K: Clone + Eq + Send + Sync + Hash + 'static,
    V: Clone + Send + Sync + 'static,
{
    CacheManager::new(max_capacity, Duration::from_secs(300)) // 5 minutes default TTL
}
