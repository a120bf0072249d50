use astdb_core::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

impl CacheLevel {
    /// Lower rank probes first; promotion copies toward rank 0.
    pub fn rank(&self) -> usize {
        match self {
            CacheLevel::L1 => 0,
            CacheLevel::L2 => 1,
            CacheLevel::L3 => 2,
        }
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheLevel::L1 => "l1",
            CacheLevel::L2 => "l2",
            CacheLevel::L3 => "l3",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: SystemTime,
    pub ttl: Option<Duration>,
    pub access_count: u64,
    pub last_accessed: SystemTime,
    pub byte_size: usize,
    pub level: CacheLevel,
}

impl<V> CacheEntry<V> {
    pub fn new(key: String, value: V, ttl: Option<Duration>, byte_size: usize, level: CacheLevel) -> Self {
        let now = SystemTime::now();
        Self {
            key,
            value,
            created_at: now,
            ttl,
            access_count: 0,
            last_accessed: now,
            byte_size,
            level,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self
                .created_at
                .elapsed()
                .map(|age| age > ttl)
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = SystemTime::now();
        self.access_count += 1;
    }
}

/// Per-level counters. Hit and miss history survives `clear`; only entry
/// and byte gauges reset.
#[derive(Debug, Default)]
pub struct LevelCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl LevelCounters {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
    pub fn evict(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LevelStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub size_bytes: u64,
}

/// Aggregated view across every enabled level.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub levels: HashMap<String, LevelStats>,
    pub promotions: u64,
    pub invalidations: u64,
    pub overall_hit_rate: f64,
    pub total_entries: usize,
    pub total_size_bytes: u64,
    pub uptime_ms: u64,
}

/// Result of a multi-level probe, including where it was found and the
/// aggregated probe latency.
#[derive(Debug)]
pub struct CacheLookup<V> {
    pub value: Option<V>,
    pub level: Option<CacheLevel>,
    pub latency: Duration,
}

impl<V> CacheLookup<V> {
    pub fn hit(&self) -> bool {
        self.value.is_some()
    }
}

/// One logical invalidation across all levels.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationEvent {
    pub reason: String,
    pub keys: Vec<String>,
    pub levels: Vec<CacheLevel>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: Option<String>,
}

/// Exact-string or regex key matching for `invalidate`.
#[derive(Debug, Clone)]
pub enum InvalidationPattern {
    Exact(String),
    Regex(String),
}

/// Common contract each level implements. Values serialize to a portable
/// binary form below L1.
#[async_trait]
pub trait CacheStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    fn level(&self) -> CacheLevel;

    async fn get(&self, key: &str) -> Result<Option<V>>;

    async fn set(&self, key: &str, value: &V, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove every entry, returning how many were dropped. Hit/miss
    /// counters are left untouched.
    async fn clear(&self) -> Result<usize>;

    /// Drop expired entries; returns the number reaped.
    async fn sweep(&self) -> Result<usize>;

    fn stats(&self) -> LevelStats;
}

pub(crate) fn encoded_size<V: serde::Serialize>(value: &V) -> usize {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map(|b| b.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_expiry_honors_ttl() {
        let mut entry = CacheEntry::new(
            "k".into(),
            42u32,
            Some(Duration::from_millis(1)),
            4,
            CacheLevel::L1,
        );
        assert!(!entry.is_expired() || entry.created_at.elapsed().unwrap() > Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(entry.is_expired());
        entry.touch();
        assert_eq!(entry.access_count, 1);
    }

    #[test]
    fn entry_without_ttl_never_expires() {
        let entry = CacheEntry::new("k".into(), 1u8, None, 1, CacheLevel::L2);
        assert!(!entry.is_expired());
    }

    #[test]
    fn level_ordering_by_rank() {
        assert!(CacheLevel::L1.rank() < CacheLevel::L2.rank());
        assert!(CacheLevel::L2.rank() < CacheLevel::L3.rank());
    }
}
