//! Capacity-bounded object cache with LRU eviction and disk persistence.
//!
//! Entries are raw origin responses keyed by (host, path, port). All
//! structural mutation (lookup promotion, insert, eviction) happens under one
//! exclusive critical section; there is no read-then-upgrade locking. The
//! persistence append runs after the in-memory lock is released, so memory
//! and disk are eventually, not atomically, consistent.

use std::collections::VecDeque;
use std::path::Path;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod persist;

pub use persist::{CacheLog, CacheRecord};

use crate::config::CacheConfig;
use crate::error::ProxyResult;

/// Cache key: one origin resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub host: String,
    pub path: String,
    pub port: u16,
}

impl CacheKey {
    pub fn new<H: Into<String>, P: Into<String>>(host: H, path: P, port: u16) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            port,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.path)
    }
}

/// One cached origin response.
///
/// `content` is the raw response bytes (status line, headers, body) and is
/// immutable once inserted; views handed out by `find` can never mutate it.
#[derive(Debug, Clone)]
struct CacheEntry {
    key: CacheKey,
    content: Bytes,
    size: u64,
    last_modified: String,
    freq: u64,
}

/// Result of a successful cache lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub content: Bytes,
    pub size: u64,
    pub last_modified: String,
}

/// Snapshot of cache state and counters
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub bypasses: u64,
}

/// Entries ordered most-recently-used first, plus the running totals.
///
/// Invariant: `total_size` equals the sum of resident entry sizes and stays
/// within `max_size` after every completed insert.
#[derive(Default)]
struct CacheInner {
    entries: VecDeque<CacheEntry>,
    total_size: u64,
    hits: u64,
    misses: u64,
    stores: u64,
    evictions: u64,
    bypasses: u64,
}

impl CacheInner {
    /// Remove the least-recently-used entry, if any
    fn evict_lru(&mut self) -> Option<CacheEntry> {
        let entry = self.entries.pop_back()?;
        self.total_size -= entry.size;
        self.evictions += 1;
        debug!("evicted {} ({} bytes)", entry.key, entry.size);
        Some(entry)
    }

    /// Remove a resident entry with the given key, if any (replace-on-insert)
    fn remove_key(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let idx = self.entries.iter().position(|e| &e.key == key)?;
        let entry = self.entries.remove(idx)?;
        self.total_size -= entry.size;
        Some(entry)
    }

    /// Insert at the MRU end and evict from the LRU end until within capacity
    fn insert(&mut self, entry: CacheEntry, max_size: u64) {
        self.total_size += entry.size;
        self.entries.push_front(entry);
        self.stores += 1;
        while self.total_size > max_size {
            self.evict_lru();
        }
    }
}

/// Bounded, concurrently accessed object cache
pub struct ObjectCache {
    inner: Mutex<CacheInner>,
    log: Option<CacheLog>,
    max_size: u64,
    max_object_size: u64,
}

impl ObjectCache {
    /// Create an empty cache without persistence
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            log: None,
            max_size: config.max_size,
            max_object_size: config.max_object_size,
        }
    }

    /// Create a cache backed by an append-only log at `path`, replaying any
    /// existing records to rebuild the resident set.
    ///
    /// Replay populates memory only; it never re-appends what it reads. A
    /// corrupt log loads partially and is never fatal.
    pub async fn with_log<P: AsRef<Path>>(config: &CacheConfig, path: P) -> ProxyResult<Self> {
        let records = persist::load_records(path.as_ref(), config.max_object_size).await;
        let replayed = records.len();

        let mut inner = CacheInner::default();
        for record in records {
            let key = CacheKey::new(record.host, record.path, record.port);
            // Same capacity/ceiling enforcement as a live insert.
            if record.content.len() as u64 > config.max_object_size {
                continue;
            }
            inner.remove_key(&key);
            let size = record.content.len() as u64;
            inner.insert(
                CacheEntry {
                    key,
                    content: record.content,
                    size,
                    last_modified: record.last_modified,
                    freq: record.freq,
                },
                config.max_size,
            );
        }
        // Replay is reconstruction, not traffic; zero the counters.
        let resident = inner.entries.len();
        inner.stores = 0;
        inner.evictions = 0;

        let log = CacheLog::open_append(path).await?;
        info!(
            "cache log replayed: {} record(s), {} resident ({} bytes)",
            replayed, resident, inner.total_size
        );

        Ok(Self {
            inner: Mutex::new(inner),
            log: Some(log),
            max_size: config.max_size,
            max_object_size: config.max_object_size,
        })
    }

    /// Per-object ceiling in bytes
    pub fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    /// Look up (host, path, port), promoting a match to most-recently-used
    /// and incrementing its frequency counter.
    ///
    /// The scan, promotion, and counter update run as one atomic unit under
    /// the exclusive lock.
    pub async fn find(&self, key: &CacheKey) -> Option<CacheHit> {
        let mut inner = self.inner.lock().await;
        let idx = match inner.entries.iter().position(|e| &e.key == key) {
            Some(idx) => idx,
            None => {
                inner.misses += 1;
                return None;
            }
        };

        let mut entry = inner
            .entries
            .remove(idx)
            .expect("scanned index out of bounds");
        entry.freq += 1;
        let hit = CacheHit {
            content: entry.content.clone(),
            size: entry.size,
            last_modified: entry.last_modified.clone(),
        };
        inner.entries.push_front(entry);
        inner.hits += 1;
        Some(hit)
    }

    /// Insert a response, evicting least-recently-used entries until the
    /// running total is within capacity.
    ///
    /// Returns false (a capacity bypass, not an error) when the content
    /// exceeds the per-object ceiling. A key that is already resident is
    /// replaced. The persistence append happens after the lock is released.
    pub async fn insert(&self, key: CacheKey, content: Bytes, last_modified: String) -> bool {
        let size = content.len() as u64;
        if size > self.max_object_size {
            let mut inner = self.inner.lock().await;
            inner.bypasses += 1;
            debug!(
                "bypass: {} ({} bytes exceeds {} byte ceiling)",
                key, size, self.max_object_size
            );
            return false;
        }

        let record = self.log.as_ref().map(|_| CacheRecord {
            freq: 0,
            port: key.port,
            host: key.host.clone(),
            path: key.path.clone(),
            content: content.clone(),
            last_modified: last_modified.clone(),
        });

        {
            let mut inner = self.inner.lock().await;
            if inner.remove_key(&key).is_some() {
                debug!("replacing resident entry for {}", key);
            }
            inner.insert(
                CacheEntry {
                    key,
                    content,
                    size,
                    last_modified,
                    freq: 0,
                },
                self.max_size,
            );
        }

        if let (Some(log), Some(record)) = (&self.log, record) {
            if let Err(e) = log.append(&record).await {
                warn!("cache entry not persisted: {}", e);
            }
        }
        true
    }

    /// Evict the least-recently-used entry; no-op when empty
    pub async fn evict_lru(&self) {
        let mut inner = self.inner.lock().await;
        inner.evict_lru();
    }

    /// Snapshot the current cache state
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            entry_count: inner.entries.len(),
            total_size: inner.total_size,
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            stores: inner.stores,
            evictions: inner.evictions,
            bypasses: inner.bypasses,
        }
    }

    /// Number of resident entries
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Whether the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Frequency counter of a resident entry, without promoting it
    #[cfg(test)]
    pub(crate) async fn frequency_of(&self, key: &CacheKey) -> Option<u64> {
        let inner = self.inner.lock().await;
        inner.entries.iter().find(|e| &e.key == key).map(|e| e.freq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(max_size: u64, max_object_size: u64) -> CacheConfig {
        CacheConfig {
            max_size,
            max_object_size,
            persist_path: None,
        }
    }

    fn key(path: &str) -> CacheKey {
        CacheKey::new("example.com", path, 80)
    }

    fn body(len: usize) -> Bytes {
        Bytes::from(vec![b'x'; len])
    }

    const MARKER: &str = "Sun, 06 Nov 1994 08:49:37 GMT";

    #[tokio::test]
    async fn test_insert_and_find() {
        let cache = ObjectCache::new(&test_config(1000, 500));
        assert!(cache.insert(key("/a"), body(100), MARKER.into()).await);

        let hit = cache.find(&key("/a")).await.unwrap();
        assert_eq!(hit.content, body(100));
        assert_eq!(hit.size, 100);
        assert_eq!(hit.last_modified, MARKER);

        assert!(cache.find(&key("/missing")).await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.total_size, 100);
    }

    #[tokio::test]
    async fn test_eviction_order() {
        // The worked example: capacity 1000, inserts of 300/400/400 evict
        // the least-recently-used entry only.
        let cache = ObjectCache::new(&test_config(1000, 500));
        assert!(cache.insert(key("/b"), body(300), MARKER.into()).await);
        assert!(cache.insert(key("/c"), body(400), MARKER.into()).await);
        assert_eq!(cache.stats().await.total_size, 700);

        assert!(cache.insert(key("/d"), body(400), MARKER.into()).await);
        let stats = cache.stats().await;
        assert_eq!(stats.total_size, 800);
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.evictions, 1);

        assert!(cache.find(&key("/b")).await.is_none());
        assert!(cache.find(&key("/c")).await.is_some());
        assert!(cache.find(&key("/d")).await.is_some());
    }

    #[tokio::test]
    async fn test_eviction_can_remove_multiple() {
        let cache = ObjectCache::new(&test_config(1000, 1000));
        assert!(cache.insert(key("/a"), body(400), MARKER.into()).await);
        assert!(cache.insert(key("/b"), body(400), MARKER.into()).await);
        // 900 bytes displaces both older entries.
        assert!(cache.insert(key("/c"), body(900), MARKER.into()).await);

        let stats = cache.stats().await;
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size, 900);
        assert_eq!(stats.evictions, 2);
        assert!(cache.find(&key("/c")).await.is_some());
    }

    #[tokio::test]
    async fn test_promotion_protects_from_eviction() {
        let cache = ObjectCache::new(&test_config(1000, 500));
        assert!(cache.insert(key("/a"), body(300), MARKER.into()).await);
        assert!(cache.insert(key("/b"), body(400), MARKER.into()).await);

        // Promote /a so /b becomes the LRU entry.
        assert!(cache.find(&key("/a")).await.is_some());
        assert!(cache.insert(key("/c"), body(400), MARKER.into()).await);

        assert!(cache.find(&key("/a")).await.is_some());
        assert!(cache.find(&key("/b")).await.is_none());
    }

    #[tokio::test]
    async fn test_frequency_counter_increases() {
        let cache = ObjectCache::new(&test_config(1000, 500));
        assert!(cache.insert(key("/a"), body(10), MARKER.into()).await);
        assert_eq!(cache.frequency_of(&key("/a")).await, Some(0));

        cache.find(&key("/a")).await.unwrap();
        cache.find(&key("/a")).await.unwrap();
        assert_eq!(cache.frequency_of(&key("/a")).await, Some(2));
    }

    #[tokio::test]
    async fn test_ceiling_bypass() {
        let cache = ObjectCache::new(&test_config(1000, 100));
        // Exactly at the ceiling is cacheable; one byte over is not.
        assert!(cache.insert(key("/fits"), body(100), MARKER.into()).await);
        assert!(!cache.insert(key("/big"), body(101), MARKER.into()).await);

        let stats = cache.stats().await;
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size, 100);
        assert_eq!(stats.bypasses, 1);
        assert!(cache.find(&key("/big")).await.is_none());
    }

    #[tokio::test]
    async fn test_replace_on_insert() {
        let cache = ObjectCache::new(&test_config(1000, 500));
        assert!(cache.insert(key("/a"), body(100), MARKER.into()).await);
        assert!(
            cache
                .insert(key("/a"), body(200), "Mon, 07 Nov 1994 08:49:37 GMT".into())
                .await
        );

        let stats = cache.stats().await;
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size, 200);

        let hit = cache.find(&key("/a")).await.unwrap();
        assert_eq!(hit.size, 200);
        assert_eq!(hit.last_modified, "Mon, 07 Nov 1994 08:49:37 GMT");
    }

    #[tokio::test]
    async fn test_evict_lru_explicit() {
        let cache = ObjectCache::new(&test_config(1000, 500));
        // No-op on an empty cache.
        cache.evict_lru().await;
        assert_eq!(cache.stats().await.total_size, 0);

        assert!(cache.insert(key("/a"), body(100), MARKER.into()).await);
        assert!(cache.insert(key("/b"), body(100), MARKER.into()).await);
        cache.evict_lru().await;

        assert!(cache.find(&key("/a")).await.is_none());
        assert!(cache.find(&key("/b")).await.is_some());
        assert_eq!(cache.stats().await.total_size, 100);
    }

    #[tokio::test]
    async fn test_total_matches_resident_sum() {
        let cache = ObjectCache::new(&test_config(1000, 400));
        for (i, size) in [120usize, 340, 80, 400, 270, 50].iter().enumerate() {
            cache
                .insert(key(&format!("/{}", i)), body(*size), MARKER.into())
                .await;
        }
        cache.evict_lru().await;

        let inner = cache.inner.lock().await;
        let sum: u64 = inner.entries.iter().map(|e| e.size).sum();
        assert_eq!(inner.total_size, sum);
        assert!(inner.total_size <= 1000);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.log");
        let config = test_config(1000, 500);

        {
            let cache = ObjectCache::with_log(&config, &path).await.unwrap();
            assert!(cache.insert(key("/a"), body(100), MARKER.into()).await);
            assert!(cache.insert(key("/b"), body(200), MARKER.into()).await);
        }

        let reloaded = ObjectCache::with_log(&config, &path).await.unwrap();
        assert_eq!(reloaded.len().await, 2);
        let hit = reloaded.find(&key("/a")).await.unwrap();
        assert_eq!(hit.content, body(100));
        assert_eq!(hit.last_modified, MARKER);
        assert_eq!(reloaded.stats().await.total_size, 300);
    }

    #[tokio::test]
    async fn test_replay_does_not_regrow_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.log");
        let config = test_config(1000, 500);

        {
            let cache = ObjectCache::with_log(&config, &path).await.unwrap();
            assert!(cache.insert(key("/a"), body(100), MARKER.into()).await);
        }
        let len_after_insert = tokio::fs::metadata(&path).await.unwrap().len();

        // Two restarts with no new inserts must leave the log untouched.
        for _ in 0..2 {
            let cache = ObjectCache::with_log(&config, &path).await.unwrap();
            assert_eq!(cache.len().await, 1);
        }
        let len_after_reloads = tokio::fs::metadata(&path).await.unwrap().len();
        assert_eq!(len_after_insert, len_after_reloads);
    }

    #[tokio::test]
    async fn test_replay_applies_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.log");
        let roomy = test_config(1000, 500);

        {
            let cache = ObjectCache::with_log(&roomy, &path).await.unwrap();
            assert!(cache.insert(key("/a"), body(400), MARKER.into()).await);
            assert!(cache.insert(key("/b"), body(400), MARKER.into()).await);
        }

        // Replaying into a smaller cache re-enforces the capacity bound.
        let tight = test_config(500, 500);
        let reloaded = ObjectCache::with_log(&tight, &path).await.unwrap();
        assert_eq!(reloaded.len().await, 1);
        assert!(reloaded.stats().await.total_size <= 500);
        // The later record is the more recently used one.
        assert!(reloaded.find(&key("/b")).await.is_some());
    }
}
