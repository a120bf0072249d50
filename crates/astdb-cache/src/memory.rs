//! L1: in-process LRU bounded by entry count and byte size, with per-entry
//! TTL and periodic expired-entry sweeps.

use crate::entry::{encoded_size, CacheEntry, CacheLevel, CacheStore, LevelCounters, LevelStats};
use astdb_core::Result;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub sweep_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

pub struct MemoryCache<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
    counters: LevelCounters,
    current_bytes: AtomicU64,
    config: MemoryCacheConfig,
}

impl<V> MemoryCache<V>
where
    V: Clone + serde::Serialize + Send + Sync + 'static,
{
    pub fn new(config: MemoryCacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_entries.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            counters: LevelCounters::default(),
            current_bytes: AtomicU64::new(0),
            config,
        }
    }

    /// Evict from the LRU tail until the byte budget holds.
    fn enforce_byte_budget(&self, entries: &mut LruCache<String, CacheEntry<V>>) {
        while self.current_bytes.load(Ordering::Relaxed) > self.config.max_bytes as u64 {
            match entries.pop_lru() {
                Some((_, evicted)) => {
                    self.current_bytes
                        .fetch_sub(evicted.byte_size as u64, Ordering::Relaxed);
                    self.counters.evict();
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl<V> CacheStore<V> for MemoryCache<V>
where
    V: Clone + serde::Serialize + Send + Sync + 'static,
{
    fn level(&self) -> CacheLevel {
        CacheLevel::L1
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired() => {
                let size = entry.byte_size as u64;
                entries.pop(key);
                self.current_bytes.fetch_sub(size, Ordering::Relaxed);
                self.counters.evict();
                self.counters.miss();
                Ok(None)
            }
            Some(entry) => {
                entry.touch();
                self.counters.hit();
                Ok(Some(entry.value.clone()))
            }
            None => {
                self.counters.miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &V, ttl: Option<Duration>) -> Result<()> {
        let byte_size = encoded_size(value);
        let entry = CacheEntry::new(key.to_string(), value.clone(), ttl, byte_size, CacheLevel::L1);

        let mut entries = self.entries.lock();
        if entries.len() == self.config.max_entries && !entries.contains(key) {
            // The put below displaces the LRU victim silently.
            self.counters.evict();
        }
        entries.put(key.to_string(), entry);
        // LruCache does not report displaced values, so the byte gauge is
        // recomputed from the live set.
        let live: u64 = entries.iter().map(|(_, e)| e.byte_size as u64).sum();
        self.current_bytes.store(live, Ordering::Relaxed);
        self.enforce_byte_budget(&mut entries);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.pop(key) {
            Some(old) => {
                self.current_bytes
                    .fetch_sub(old.byte_size as u64, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().iter().map(|(k, _)| k.clone()).collect())
    }

    async fn clear(&self) -> Result<usize> {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        self.current_bytes.store(0, Ordering::Relaxed);
        Ok(dropped)
    }

    async fn sweep(&self) -> Result<usize> {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(old) = entries.pop(key) {
                self.current_bytes
                    .fetch_sub(old.byte_size as u64, Ordering::Relaxed);
                self.counters.evict();
            }
        }
        if !expired.is_empty() {
            trace!("l1 sweep reaped {} entries", expired.len());
        }
        Ok(expired.len())
    }

    fn stats(&self) -> LevelStats {
        let entries = self.entries.lock();
        LevelStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: entries.len(),
            size_bytes: self.current_bytes.load(Ordering::Relaxed),
        }
    }
}
