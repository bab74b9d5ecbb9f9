/// Read-through cache with TTL and prefix invalidation
///
/// `CacheStore` prefers a remote Redis backend and falls back to an in-process
/// map when Redis is unreachable at startup or any later call fails. Falling
/// back is permanent for the lifetime of the store. Cache failures are never
/// surfaced to callers: a failed `get` is a miss and a failed `set` is a no-op
/// on the remote side.
pub mod memory;
pub mod redis;
pub mod resp;

use crate::config::CacheConfig;
use crate::core::dsn;
use async_trait::async_trait;
use bytes::Bytes;
use memory::MemoryBackend;
use redis::RedisBackend;
use resp::RespParseError;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Which backend is serving requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendKind {
    Redis,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Redis => write!(f, "REDIS"),
            BackendKind::Memory => write!(f, "MEMORY"),
        }
    }
}

/// Failures of a cache backend; absorbed by `CacheStore`
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid cache URL: {0}")]
    InvalidUrl(String),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache protocol error: {0}")]
    Protocol(#[from] RespParseError),

    #[error("Cache command failed: {0}")]
    Command(String),

    #[error("Unexpected cache reply: {0}")]
    UnexpectedReply(String),

    #[error("Cache command timed out after {0:?}")]
    Timeout(Duration),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Storage behind a `CacheStore`
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>>;

    /// Store `value` for `ttl`; callers never pass a zero TTL
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Remove every key starting with `prefix`, returning how many were removed
    async fn invalidate_prefix(&self, prefix: &str) -> CacheResult<u64>;
}

/// Process-lifetime cache counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub backend: BackendKind,
    pub backend_degraded: bool,
    pub invalidations: u64,
    pub entries_evicted: u64,
}

pub struct CacheStore {
    remote: Option<Box<dyn CacheBackend>>,
    local: MemoryBackend,
    degraded: AtomicBool,
    max_ttl: Duration,
    command_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStore {
    /// Build the store from configuration, probing Redis when a URL is set
    pub async fn connect(config: &CacheConfig) -> Self {
        let Some(url) = config.redis_url.as_deref() else {
            info!("No Redis URL configured, using in-process cache");
            return Self::build(None, false, config);
        };

        let limit = config.connect_timeout();
        match timeout(limit, RedisBackend::connect(url, config.key_namespace.clone())).await {
            Ok(Ok(backend)) => {
                info!(url = %dsn::redact(url), "Using Redis cache backend");
                Self::build(Some(Box::new(backend)), false, config)
            }
            Ok(Err(e)) => {
                warn!(
                    url = %dsn::redact(url),
                    "Redis unavailable, using in-process cache: {}",
                    e
                );
                Self::build(None, true, config)
            }
            Err(_) => {
                warn!(
                    url = %dsn::redact(url),
                    timeout_ms = limit.as_millis() as u64,
                    "Redis connect timed out, using in-process cache"
                );
                Self::build(None, true, config)
            }
        }
    }

    /// In-process store only
    pub fn memory(config: &CacheConfig) -> Self {
        Self::build(None, false, config)
    }

    /// Store backed by a caller-supplied remote backend
    pub fn with_backend(backend: Box<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self::build(Some(backend), false, config)
    }

    fn build(remote: Option<Box<dyn CacheBackend>>, degraded: bool, config: &CacheConfig) -> Self {
        Self {
            remote,
            local: MemoryBackend::new(config.max_entries),
            degraded: AtomicBool::new(degraded),
            max_ttl: config.max_ttl(),
            command_timeout: config.command_timeout(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Backend currently serving requests
    pub fn backend_kind(&self) -> BackendKind {
        match self.active_remote() {
            Some(remote) => remote.kind(),
            None => BackendKind::Memory,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let value = match self.active_remote() {
            Some(remote) => match self.guarded("get", remote.get(key)).await {
                Some(value) => value,
                None => self.local.lookup(key),
            },
            None => self.local.lookup(key),
        };

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Store `value` under `key`; the TTL is capped at `max_ttl` and zero deletes
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        if ttl.is_zero() {
            self.delete(key).await;
            return;
        }
        let ttl = ttl.min(self.max_ttl);

        if let Some(remote) = self.active_remote() {
            if self.guarded("set", remote.set(key, value.clone(), ttl)).await.is_some() {
                return;
            }
        }
        self.local.store(key, value, ttl);
    }

    pub async fn delete(&self, key: &str) {
        if let Some(remote) = self.active_remote() {
            if self.guarded("delete", remote.delete(key)).await.is_some() {
                return;
            }
        }
        self.local.remove(key);
    }

    /// Drop a value the caller could not use and count its lookup as a miss
    pub async fn discard(&self, key: &str) {
        // Never below zero
        let _ = self
            .hits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |hits| hits.checked_sub(1));
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.delete(key).await;
    }

    /// Remove every entry whose key starts with `prefix`
    pub async fn invalidate_prefix(&self, prefix: &str) -> u64 {
        self.invalidations.fetch_add(1, Ordering::Relaxed);

        if let Some(remote) = self.active_remote() {
            if let Some(removed) = self
                .guarded("invalidate_prefix", remote.invalidate_prefix(prefix))
                .await
            {
                debug!(prefix, removed, "Invalidated cache prefix");
                return removed;
            }
        }

        let removed = self.local.remove_prefix(prefix);
        debug!(prefix, removed, "Invalidated cache prefix");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            backend: self.backend_kind(),
            backend_degraded: self.is_degraded(),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries_evicted: self.local.evicted(),
        }
    }

    fn active_remote(&self) -> Option<&dyn CacheBackend> {
        if self.is_degraded() {
            return None;
        }
        self.remote.as_deref()
    }

    /// Run a remote call under `command_timeout`; `None` means the store degraded
    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> Option<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        match timeout(self.command_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.degrade(operation, &e);
                None
            }
            Err(_) => {
                self.degrade(operation, &CacheError::Timeout(self.command_timeout));
                None
            }
        }
    }

    fn degrade(&self, operation: &str, error: &CacheError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                operation,
                "Cache backend unavailable, degrading to in-process cache: {}",
                error
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRedis;

    fn config() -> CacheConfig {
        CacheConfig::default()
    }

    /// Remote backend whose every call fails
    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Redis
        }

        async fn get(&self, _key: &str) -> CacheResult<Option<Bytes>> {
            Err(CacheError::Unavailable("connection reset".to_string()))
        }

        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Unavailable("connection reset".to_string()))
        }

        async fn delete(&self, _key: &str) -> CacheResult<()> {
            Err(CacheError::Unavailable("connection reset".to_string()))
        }

        async fn invalidate_prefix(&self, _prefix: &str) -> CacheResult<u64> {
            Err(CacheError::Unavailable("connection reset".to_string()))
        }
    }

    /// Remote backend that never answers
    struct StalledBackend;

    #[async_trait]
    impl CacheBackend for StalledBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Redis
        }

        async fn get(&self, _key: &str) -> CacheResult<Option<Bytes>> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> CacheResult<()> {
            std::future::pending().await
        }

        async fn delete(&self, _key: &str) -> CacheResult<()> {
            std::future::pending().await
        }

        async fn invalidate_prefix(&self, _prefix: &str) -> CacheResult<u64> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = CacheStore::memory(&config());
        cache
            .set("user:1", Bytes::from_static(b"alice"), Duration::from_millis(100))
            .await;

        assert_eq!(cache.get("user:1").await, Some(Bytes::from_static(b"alice")));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get("user:1").await, None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_capped_at_max_ttl() {
        let config = CacheConfig {
            max_ttl_sec: 1,
            ..config()
        };
        let cache = CacheStore::memory(&config);
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(3600))
            .await;

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_zero_ttl_deletes() {
        let cache = CacheStore::memory(&config());
        cache.set("k", Bytes::from_static(b"v"), Duration::from_secs(60)).await;
        cache.set("k", Bytes::from_static(b"w"), Duration::ZERO).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_discard_moves_hit_to_miss() {
        let cache = CacheStore::memory(&config());
        cache.set("k", Bytes::from_static(b"v"), Duration::from_secs(60)).await;

        assert!(cache.get("k").await.is_some());
        cache.discard("k").await;
        assert_eq!(cache.get("k").await, None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 2);

        // Without a preceding hit the hit counter stays at zero
        cache.discard("other").await;
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 3);
    }

    #[tokio::test]
    async fn test_prefix_invalidation_counts_calls() {
        let cache = CacheStore::memory(&config());
        let ttl = Duration::from_secs(60);
        cache.set("user:1:profile", Bytes::from_static(b"a"), ttl).await;
        cache.set("user:1:posts", Bytes::from_static(b"b"), ttl).await;
        cache.set("user:2:profile", Bytes::from_static(b"c"), ttl).await;

        assert_eq!(cache.invalidate_prefix("user:1:").await, 2);
        assert_eq!(cache.invalidate_prefix("user:9:").await, 0);

        assert!(cache.get("user:1:profile").await.is_none());
        assert!(cache.get("user:1:posts").await.is_none());
        assert!(cache.get("user:2:profile").await.is_some());
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[tokio::test]
    async fn test_no_redis_url_is_memory_not_degraded() {
        let cache = CacheStore::connect(&config()).await;
        let stats = cache.stats();
        assert_eq!(stats.backend, BackendKind::Memory);
        assert!(!stats.backend_degraded);
    }

    #[tokio::test]
    async fn test_unreachable_redis_degrades_at_startup() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = CacheConfig {
            redis_url: Some(format!("redis://{}", addr)),
            ..config()
        };
        let cache = CacheStore::connect(&config).await;

        cache.set("k", Bytes::from_static(b"v"), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"v")));

        let stats = cache.stats();
        assert_eq!(stats.backend, BackendKind::Memory);
        assert!(stats.backend_degraded);
    }

    #[tokio::test]
    async fn test_redis_backend_in_use() {
        let server = FakeRedis::start().await;
        let config = CacheConfig {
            redis_url: Some(server.url()),
            ..config()
        };
        let cache = CacheStore::connect(&config).await;
        assert_eq!(cache.backend_kind(), BackendKind::Redis);

        cache.set("user:1", Bytes::from_static(b"alice"), Duration::from_secs(5)).await;
        assert_eq!(server.keys(), vec!["estrada:user:1"]);
        assert_eq!(cache.get("user:1").await, Some(Bytes::from_static(b"alice")));
        assert!(!cache.is_degraded());
    }

    #[tokio::test]
    async fn test_failing_call_degrades_once_and_keeps_working() {
        let cache = CacheStore::with_backend(Box::new(BrokenBackend), &config());
        assert_eq!(cache.backend_kind(), BackendKind::Redis);

        cache.set("k", Bytes::from_static(b"v"), Duration::from_secs(60)).await;
        assert!(cache.is_degraded());
        assert_eq!(cache.backend_kind(), BackendKind::Memory);

        // Served from memory from now on
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"v")));
        assert_eq!(cache.invalidate_prefix("k").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_call_times_out_and_degrades() {
        let config = CacheConfig {
            command_timeout_ms: 50,
            ..config()
        };
        let cache = CacheStore::with_backend(Box::new(StalledBackend), &config);

        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_degraded());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_backend_kind_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&BackendKind::Memory).unwrap(), "\"MEMORY\"");
        assert_eq!(BackendKind::Redis.to_string(), "REDIS");
    }
}
