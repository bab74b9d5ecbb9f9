/// In-process cache backend
///
/// Bounded map with the same TTL semantics as the remote backend. Used when no
/// Redis is configured and as the fallback once the remote backend degrades.
use super::{BackendKind, CacheBackend, CacheResult};
use async_trait::async_trait;
use bytes::Bytes;
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// A cached value and its lifetime
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub expires_at: Instant,
    pub created_at: Instant,
}

impl CacheEntry {
    fn new(key: String, value: Bytes, ttl: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            key,
            value,
            expires_at: created_at + ttl,
            created_at,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
pub struct MemoryBackend {
    entries: Mutex<FnvHashMap<String, CacheEntry>>,
    max_entries: usize,
    evicted: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl MemoryBackend {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(FnvHashMap::default()),
            max_entries: max_entries.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, FnvHashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn lookup(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.entries();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub fn store(&self, key: &str, value: Bytes, ttl: Duration) {
        let mut entries = self.entries();
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            self.make_room(&mut entries);
        }
        entries.insert(key.to_string(), CacheEntry::new(key.to_string(), value, ttl));
    }

    pub fn remove(&self, key: &str) {
        self.entries().remove(key);
    }

    /// Remove every key starting with `prefix`, returning how many were removed
    pub fn remove_prefix(&self, prefix: &str) -> u64 {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        (before - entries.len()) as u64
    }

    /// Entry currently stored under `key`, expired or not
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries evicted to stay within `max_entries`
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Purge expired entries; if still full, evict the entry closest to expiry
    fn make_room(&self, entries: &mut FnvHashMap<String, CacheEntry>) {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            trace!(purged, "Purged expired cache entries");
        }

        if entries.len() >= self.max_entries {
            let victim = entries
                .values()
                .min_by_key(|entry| entry.expires_at)
                .map(|entry| entry.key.clone());
            if let Some(key) = victim {
                entries.remove(&key);
                self.evicted.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Evicted cache entry at capacity");
            }
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        Ok(self.lookup(key))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        self.store(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.remove(key);
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> CacheResult<u64> {
        Ok(self.remove_prefix(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_at_ttl() {
        let backend = MemoryBackend::default();
        backend.store("user:1", Bytes::from_static(b"alice"), Duration::from_millis(100));

        let entry = backend.entry("user:1").unwrap();
        assert_eq!(entry.expires_at - entry.created_at, Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(backend.lookup("user:1"), Some(Bytes::from_static(b"alice")));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(backend.lookup("user:1"), None);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_remove_prefix_only_touches_matches() {
        let backend = MemoryBackend::default();
        let ttl = Duration::from_secs(60);
        backend.store("user:1:profile", Bytes::from_static(b"a"), ttl);
        backend.store("user:1:posts", Bytes::from_static(b"b"), ttl);
        backend.store("user:10:profile", Bytes::from_static(b"c"), ttl);
        backend.store("post:1", Bytes::from_static(b"d"), ttl);

        assert_eq!(backend.remove_prefix("user:1:"), 2);
        assert!(backend.lookup("user:1:profile").is_none());
        assert!(backend.lookup("user:1:posts").is_none());
        assert!(backend.lookup("user:10:profile").is_some());
        assert!(backend.lookup("post:1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_purges_expired_first() {
        let backend = MemoryBackend::new(2);
        backend.store("short", Bytes::from_static(b"1"), Duration::from_millis(10));
        backend.store("long", Bytes::from_static(b"2"), Duration::from_secs(60));

        tokio::time::advance(Duration::from_millis(20)).await;
        backend.store("new", Bytes::from_static(b"3"), Duration::from_secs(60));

        assert_eq!(backend.len(), 2);
        assert!(backend.lookup("long").is_some());
        assert!(backend.lookup("new").is_some());
        assert_eq!(backend.evicted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_closest_to_expiry() {
        let backend = MemoryBackend::new(2);
        backend.store("a", Bytes::from_static(b"1"), Duration::from_secs(30));
        backend.store("b", Bytes::from_static(b"2"), Duration::from_secs(10));
        backend.store("c", Bytes::from_static(b"3"), Duration::from_secs(20));

        assert_eq!(backend.len(), 2);
        assert!(backend.lookup("b").is_none());
        assert!(backend.lookup("a").is_some());
        assert!(backend.lookup("c").is_some());
        assert_eq!(backend.evicted(), 1);
    }

    #[test]
    fn test_overwrite_at_capacity_does_not_evict() {
        let backend = MemoryBackend::new(1);
        let ttl = Duration::from_secs(60);
        backend.store("a", Bytes::from_static(b"1"), ttl);
        backend.store("a", Bytes::from_static(b"2"), ttl);

        assert_eq!(backend.lookup("a"), Some(Bytes::from_static(b"2")));
        assert_eq!(backend.evicted(), 0);
    }

    #[tokio::test]
    async fn test_backend_trait_delete() {
        let backend = MemoryBackend::default();
        assert_eq!(backend.kind(), BackendKind::Memory);

        backend
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(1))
            .await
            .unwrap();
        backend.delete("k").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
    }
}
