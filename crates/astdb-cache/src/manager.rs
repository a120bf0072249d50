//! Multi-level front: probe L1→L2→L3 with promotion, write-through sets,
//! pattern invalidation across every level, warming, and aggregate stats.
//!
//! Cross-level operations hold no cross-level lock; each per-level
//! operation is idempotent, so partial progress under concurrency is
//! acceptable by design of the level contracts.

use crate::database::{DatabaseCache, TopQuery};
use crate::disk::{DiskCache, DiskCacheConfig};
use crate::entry::{
    CacheLevel, CacheLookup, CacheStats, CacheStore, InvalidationEvent, InvalidationPattern,
    LevelStats,
};
use crate::memory::{MemoryCache, MemoryCacheConfig};
use astdb_core::{AstDbError, EngineEvent, EventBus, QueryLogRecord, Result};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    pub enable_l1: bool,
    pub enable_l2: bool,
    pub enable_l3: bool,
    pub promotion_enabled: bool,
    pub warming_enabled: bool,
    pub default_ttl: Option<Duration>,
    pub l1: MemoryCacheConfig,
    pub l2_dir: PathBuf,
    pub l2_max_entries: usize,
    pub l2_max_bytes: u64,
    pub l3_path: PathBuf,
}

impl CacheManagerConfig {
    pub fn new(l2_dir: impl Into<PathBuf>, l3_path: impl Into<PathBuf>) -> Self {
        Self {
            enable_l1: true,
            enable_l2: true,
            enable_l3: true,
            promotion_enabled: true,
            warming_enabled: true,
            default_ttl: Some(Duration::from_secs(3600)),
            l1: MemoryCacheConfig::default(),
            l2_dir: l2_dir.into(),
            l2_max_entries: 100_000,
            l2_max_bytes: 512 * 1024 * 1024,
            l3_path: l3_path.into(),
        }
    }

    /// Everything off: the manager degrades to a pass-through that always
    /// misses.
    pub fn disabled() -> Self {
        Self {
            enable_l1: false,
            enable_l2: false,
            enable_l3: false,
            promotion_enabled: false,
            warming_enabled: false,
            default_ttl: None,
            l1: MemoryCacheConfig::default(),
            l2_dir: PathBuf::new(),
            l2_max_entries: 0,
            l2_max_bytes: 0,
            l3_path: PathBuf::new(),
        }
    }
}

pub struct MultiLevelCache<V>
where
    V: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    levels: Vec<Arc<dyn CacheStore<V>>>,
    l3: Option<Arc<DatabaseCache<V>>>,
    config: CacheManagerConfig,
    promotions: AtomicU64,
    invalidations: AtomicU64,
    set_failures: AtomicU64,
    started: Instant,
    events: Option<Arc<EventBus>>,
}

impl<V> MultiLevelCache<V>
where
    V: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    pub fn open(config: CacheManagerConfig) -> Result<Self> {
        let mut levels: Vec<Arc<dyn CacheStore<V>>> = Vec::new();
        let mut l3 = None;

        if config.enable_l1 {
            levels.push(Arc::new(MemoryCache::new(config.l1.clone())));
        }
        if config.enable_l2 {
            levels.push(Arc::new(DiskCache::open(DiskCacheConfig {
                dir: config.l2_dir.clone(),
                max_entries: config.l2_max_entries,
                max_bytes: config.l2_max_bytes,
            })?));
        }
        if config.enable_l3 {
            let db = Arc::new(DatabaseCache::open(&config.l3_path)?);
            levels.push(db.clone() as Arc<dyn CacheStore<V>>);
            l3 = Some(db);
        }

        info!(
            "cache manager open: {} levels enabled (promotion {})",
            levels.len(),
            config.promotion_enabled
        );
        Ok(Self {
            levels,
            l3,
            config,
            promotions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            set_failures: AtomicU64::new(0),
            started: Instant::now(),
            events: None,
        })
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn enabled_levels(&self) -> Vec<CacheLevel> {
        self.levels.iter().map(|l| l.level()).collect()
    }

    /// Probe levels fastest-first. A hit below L1 is promoted into every
    /// faster enabled level unless promotion is disabled.
    pub async fn get(&self, key: &str) -> CacheLookup<V> {
        let started = Instant::now();
        for (position, level) in self.levels.iter().enumerate() {
            match level.get(key).await {
                Ok(Some(value)) => {
                    if self.config.promotion_enabled && position > 0 {
                        for faster in &self.levels[..position] {
                            if let Err(e) = faster
                                .set(key, &value, self.config.default_ttl)
                                .await
                            {
                                warn!("promotion to {} failed: {}", faster.level(), e);
                            }
                        }
                        self.promotions.fetch_add(1, Ordering::Relaxed);
                    }
                    return CacheLookup {
                        value: Some(value),
                        level: Some(level.level()),
                        latency: started.elapsed(),
                    };
                }
                Ok(None) => {}
                Err(e) => warn!("cache level {} probe failed: {}", level.level(), e),
            }
        }
        CacheLookup {
            value: None,
            level: None,
            latency: started.elapsed(),
        }
    }

    /// Write to every enabled level concurrently. A failing level does not
    /// abort the others; failures are counted and returned.
    pub async fn set(&self, key: &str, value: &V, ttl: Option<Duration>) -> usize {
        let ttl = ttl.or(self.config.default_ttl);
        let writes = self.levels.iter().map(|level| {
            let level = Arc::clone(level);
            let key = key.to_string();
            let value = value.clone();
            async move { level.set(&key, &value, ttl).await.map_err(|e| (level.level(), e)) }
        });
        let results = futures::future::join_all(writes).await;
        let mut failed = 0;
        for result in results {
            if let Err((level, e)) = result {
                warn!("cache set at {} failed: {}", level, e);
                failed += 1;
            }
        }
        self.set_failures.fetch_add(failed as u64, Ordering::Relaxed);
        failed
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut any = false;
        for level in &self.levels {
            match level.delete(key).await {
                Ok(removed) => any |= removed,
                Err(e) => warn!("cache delete at {} failed: {}", level.level(), e),
            }
        }
        any
    }

    /// Evaluate the pattern against the union of keys across all levels,
    /// delete matches everywhere, and return the single logical event.
    pub async fn invalidate(
        &self,
        pattern: InvalidationPattern,
        reason: impl Into<String>,
        context: Option<String>,
    ) -> Result<InvalidationEvent> {
        let reason = reason.into();
        let mut union: BTreeSet<String> = BTreeSet::new();
        for level in &self.levels {
            match level.keys().await {
                Ok(keys) => union.extend(keys),
                Err(e) => warn!("key listing at {} failed: {}", level.level(), e),
            }
        }

        let matched: Vec<String> = match &pattern {
            InvalidationPattern::Exact(exact) => {
                union.into_iter().filter(|k| k == exact).collect()
            }
            InvalidationPattern::Regex(raw) => {
                let re = Regex::new(raw)
                    .map_err(|e| AstDbError::InvalidConfig(format!("bad pattern {}: {}", raw, e)))?;
                union.into_iter().filter(|k| re.is_match(k)).collect()
            }
        };

        for key in &matched {
            self.delete(key).await;
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);

        let event = InvalidationEvent {
            reason: reason.clone(),
            keys: matched,
            levels: self.enabled_levels(),
            timestamp: chrono::Utc::now(),
            context,
        };
        if let Some(events) = &self.events {
            events.emit(EngineEvent::CacheInvalidated {
                reason,
                key_count: event.keys.len(),
            });
        }
        debug!("invalidated {} keys", event.keys.len());
        Ok(event)
    }

    /// Pre-populate every level. No-op when warming is disabled.
    pub async fn warm_cache(&self, entries: Vec<(String, V)>) -> usize {
        if !self.config.warming_enabled {
            return 0;
        }
        let mut warmed = 0;
        for (key, value) in entries {
            self.set(&key, &value, self.config.default_ttl).await;
            warmed += 1;
        }
        warmed
    }

    /// Drop every entry everywhere. Entry counts go to zero; hit/miss
    /// history is preserved by the level counters.
    pub async fn clear(&self) {
        for level in &self.levels {
            if let Err(e) = level.clear().await {
                warn!("clear at {} failed: {}", level.level(), e);
            }
        }
    }

    /// Reap expired entries on every level; used by the periodic sweeper.
    pub async fn sweep(&self) -> usize {
        let mut reaped = 0;
        for level in &self.levels {
            match level.sweep().await {
                Ok(n) => reaped += n,
                Err(e) => warn!("sweep at {} failed: {}", level.level(), e),
            }
        }
        reaped
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let reaped = cache.sweep().await;
                if reaped > 0 {
                    debug!("periodic sweep reaped {} entries", reaped);
                }
            }
        });
    }

    pub fn stats(&self) -> CacheStats {
        let mut levels = HashMap::new();
        let mut hits = 0u64;
        let mut misses = 0u64;
        let mut total_entries = 0usize;
        let mut total_size = 0u64;
        for level in &self.levels {
            let stats: LevelStats = level.stats();
            hits += stats.hits;
            misses += stats.misses;
            total_entries += stats.entries;
            total_size += stats.size_bytes;
            levels.insert(level.level().to_string(), stats);
        }
        CacheStats {
            levels,
            promotions: self.promotions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            overall_hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            total_entries,
            total_size_bytes: total_size,
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    // ---- query log (L3) ----

    pub async fn log_query(&self, record: QueryLogRecord) -> Result<()> {
        match &self.l3 {
            Some(l3) => l3.log_query(record).await,
            None => Ok(()),
        }
    }

    pub async fn get_top_queries(&self, limit: usize) -> Result<Vec<TopQuery>> {
        match &self.l3 {
            Some(l3) => l3.get_top_queries(limit).await,
            None => Ok(Vec::new()),
        }
    }
}
