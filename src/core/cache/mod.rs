//! Content-addressable cache for synthesized audio.
//!
//! Keys are derived from every parameter that affects the produced bytes
//! (provider, voice, model, rate, text). The store is bounded by total
//! payload weight and entries expire on a TTL, so one long-running process
//! cannot grow without limit.

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_128;

/// Cache configuration. Defaults bound the store to 64 MiB of audio with a
/// 30 minute idle expiry.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum total payload size in bytes.
    pub max_capacity_bytes: u64,
    /// Idle expiry for entries, in seconds.
    pub time_to_idle_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_capacity_bytes: 64 * 1024 * 1024,
            time_to_idle_secs: 30 * 60,
        }
    }
}

/// Hit/miss counters, shared across clones of the cache handle.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl CacheMetrics {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }
}

/// Derives the cache key for one synthesis call from its parameter preimage.
///
/// The preimage must include every synthesis parameter that changes the
/// produced audio; providers build it via
/// [`crate::core::tts::SynthesisService::cache_key`].
pub fn synthesis_cache_key(preimage: &str) -> String {
    format!("tts:{:032x}", xxh3_128(preimage.as_bytes()))
}

/// Bounded audio cache keyed by [`synthesis_cache_key`] digests.
#[derive(Clone)]
pub struct SynthesisCache {
    store: moka::future::Cache<String, Bytes>,
    metrics: Arc<CacheMetrics>,
}

impl SynthesisCache {
    /// Builds the cache a config describes, or `None` when caching is
    /// disabled.
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        config.enabled.then(|| Self::new(config))
    }

    pub fn new(config: &CacheConfig) -> Self {
        let store = moka::future::Cache::builder()
            .max_capacity(config.max_capacity_bytes)
            .weigher(|_key: &String, value: &Bytes| value.len().try_into().unwrap_or(u32::MAX))
            .time_to_idle(Duration::from_secs(config.time_to_idle_secs))
            .build();
        Self {
            store,
            metrics: Arc::new(CacheMetrics::default()),
        }
    }

    /// Looks an entry up, counting the hit or miss.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match self.store.get(key).await {
            Some(audio) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, size = audio.len(), "synthesis cache hit");
                Some(audio)
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores the complete audio of one synthesis call. Empty payloads are
    /// not cached.
    pub async fn put(&self, key: String, audio: Bytes) {
        if audio.is_empty() {
            return;
        }
        self.metrics.stores.fetch_add(1, Ordering::Relaxed);
        self.store.insert(key, audio).await;
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

impl std::fmt::Debug for SynthesisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisCache")
            .field("entry_count", &self.store.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic_and_parameter_sensitive() {
        let a = synthesis_cache_key("mock:alloy:v1:1.0:你好");
        let b = synthesis_cache_key("mock:alloy:v1:1.0:你好");
        let c = synthesis_cache_key("mock:alloy:v1:1.1:你好");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("tts:"));
        // 128-bit digest rendered as 32 hex chars
        assert_eq!(a.len(), "tts:".len() + 32);
    }

    #[tokio::test]
    async fn test_round_trip_and_metrics() {
        let cache = SynthesisCache::new(&CacheConfig::default());
        let key = synthesis_cache_key("mock:alloy:v1:1.0:hello");

        assert!(cache.get(&key).await.is_none());
        cache.put(key.clone(), Bytes::from_static(b"pcm")).await;
        assert_eq!(cache.get(&key).await.unwrap(), Bytes::from_static(b"pcm"));

        assert_eq!(cache.metrics().hits(), 1);
        assert_eq!(cache.metrics().misses(), 1);
        assert_eq!(cache.metrics().stores(), 1);
    }

    #[test]
    fn test_disabled_config_builds_no_cache() {
        let disabled = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(SynthesisCache::from_config(&disabled).is_none());
        assert!(SynthesisCache::from_config(&CacheConfig::default()).is_some());
    }

    #[tokio::test]
    async fn test_empty_payload_is_not_cached() {
        let cache = SynthesisCache::new(&CacheConfig::default());
        cache.put("tts:empty".into(), Bytes::new()).await;
        assert!(cache.get("tts:empty").await.is_none());
        assert_eq!(cache.metrics().stores(), 0);
    }
}
