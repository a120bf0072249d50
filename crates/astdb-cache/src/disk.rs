//! L2: on-disk content-addressed store. Each entry lives in a file named
//! by the SHA-256 of its key, sharded two hex chars deep, serialized with
//! bincode. An in-memory manifest carries the LRU/TTL bookkeeping; it is
//! rebuilt by scanning the shard tree on open.

use crate::entry::{CacheLevel, CacheStore, LevelCounters, LevelStats};
use astdb_core::{AstDbError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    pub dir: PathBuf,
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl DiskCacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_entries: 100_000,
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

/// On-disk representation; the value is kept as opaque bincode bytes so the
/// manifest scan can read headers without knowing `V`.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    created_at_ms: u64,
    ttl_ms: Option<u64>,
    value: Vec<u8>,
}

#[derive(Debug, Clone)]
struct ManifestEntry {
    path: PathBuf,
    byte_size: u64,
    created_at_ms: u64,
    ttl_ms: Option<u64>,
    last_accessed_ms: u64,
}

impl ManifestEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        match self.ttl_ms {
            Some(ttl) => now_ms.saturating_sub(self.created_at_ms) > ttl,
            None => false,
        }
    }
}

pub struct DiskCache<V> {
    config: DiskCacheConfig,
    manifest: DashMap<String, ManifestEntry>,
    counters: LevelCounters,
    current_bytes: AtomicU64,
    evict_lock: Mutex<()>,
    _value: PhantomData<fn() -> V>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn cache_err(e: impl std::fmt::Display) -> AstDbError {
    AstDbError::Cache(e.to_string())
}

impl<V> DiskCache<V>
where
    V: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    pub fn open(config: DiskCacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let cache = Self {
            manifest: DashMap::new(),
            counters: LevelCounters::default(),
            current_bytes: AtomicU64::new(0),
            evict_lock: Mutex::new(()),
            config,
            _value: PhantomData,
        };
        cache.rescan()?;
        Ok(cache)
    }

    fn shard_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.config.dir.join(&hex[..2]).join(format!("{}.bin", &hex[2..]))
    }

    /// Rebuild the manifest from the shard tree. Unreadable files are
    /// dropped rather than trusted.
    fn rescan(&self) -> Result<()> {
        let mut total = 0u64;
        for shard in std::fs::read_dir(&self.config.dir)? {
            let shard = shard?;
            if !shard.path().is_dir() {
                continue;
            }
            for file in std::fs::read_dir(shard.path())? {
                let file = file?;
                let path = file.path();
                match std::fs::read(&path)
                    .map_err(cache_err)
                    .and_then(|bytes| decode_stored(&bytes))
                {
                    Ok(stored) => {
                        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
                        total += size;
                        self.manifest.insert(
                            stored.key.clone(),
                            ManifestEntry {
                                path,
                                byte_size: size,
                                created_at_ms: stored.created_at_ms,
                                ttl_ms: stored.ttl_ms,
                                last_accessed_ms: stored.created_at_ms,
                            },
                        );
                    }
                    Err(e) => {
                        warn!("dropping unreadable l2 entry {}: {}", path.display(), e);
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
        }
        self.current_bytes.store(total, Ordering::Relaxed);
        debug!("l2 manifest: {} entries, {} bytes", self.manifest.len(), total);
        Ok(())
    }

    fn remove_entry(&self, key: &str) -> bool {
        if let Some((_, entry)) = self.manifest.remove(key) {
            let _ = std::fs::remove_file(&entry.path);
            self.current_bytes
                .fetch_sub(entry.byte_size.min(self.current_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// LRU eviction by `last_accessed` until both budgets hold. A single
    /// evictor runs at a time; concurrent setters just skip.
    fn enforce_budgets(&self) {
        let Some(_guard) = self.evict_lock.try_lock() else {
            return;
        };
        while self.manifest.len() > self.config.max_entries
            || self.current_bytes.load(Ordering::Relaxed) > self.config.max_bytes
        {
            let victim = self
                .manifest
                .iter()
                .min_by_key(|e| e.value().last_accessed_ms)
                .map(|e| e.key().clone());
            match victim {
                Some(key) => {
                    if self.remove_entry(&key) {
                        self.counters.evict();
                    }
                }
                None => break,
            }
        }
    }
}

fn decode_stored(bytes: &[u8]) -> Result<StoredEntry> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(cache_err)
}

#[async_trait]
impl<V> CacheStore<V> for DiskCache<V>
where
    V: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    fn level(&self) -> CacheLevel {
        CacheLevel::L2
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        let now = now_ms();
        let path = match self.manifest.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired(now) {
                    drop(entry);
                    self.remove_entry(key);
                    self.counters.evict();
                    self.counters.miss();
                    return Ok(None);
                }
                entry.last_accessed_ms = now;
                entry.path.clone()
            }
            None => {
                self.counters.miss();
                return Ok(None);
            }
        };

        let bytes = tokio::task::spawn_blocking(move || std::fs::read(&path))
            .await
            .map_err(cache_err)?;
        match bytes {
            Ok(bytes) => {
                let stored = decode_stored(&bytes)?;
                let value: V =
                    bincode::serde::decode_from_slice(&stored.value, bincode::config::standard())
                        .map(|(v, _)| v)
                        .map_err(cache_err)?;
                self.counters.hit();
                Ok(Some(value))
            }
            Err(_) => {
                // Manifest said present but the file vanished underneath
                // us; heal the manifest and report a miss.
                self.manifest.remove(key);
                self.counters.miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &V, ttl: Option<Duration>) -> Result<()> {
        let stored = StoredEntry {
            key: key.to_string(),
            created_at_ms: now_ms(),
            ttl_ms: ttl.map(|d| d.as_millis() as u64),
            value: bincode::serde::encode_to_vec(value, bincode::config::standard())
                .map_err(cache_err)?,
        };
        let bytes =
            bincode::serde::encode_to_vec(&stored, bincode::config::standard()).map_err(cache_err)?;
        let path = self.shard_path(key);

        let write_path = path.clone();
        let byte_len = bytes.len() as u64;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = write_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = write_path.with_extension("tmp");
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, &write_path)?;
            Ok(())
        })
        .await
        .map_err(cache_err)?
        .map_err(AstDbError::Io)?;

        if let Some((_, old)) = self.manifest.remove(key) {
            self.current_bytes
                .fetch_sub(old.byte_size, Ordering::Relaxed);
        }
        self.manifest.insert(
            key.to_string(),
            ManifestEntry {
                path,
                byte_size: byte_len,
                created_at_ms: stored.created_at_ms,
                ttl_ms: stored.ttl_ms,
                last_accessed_ms: stored.created_at_ms,
            },
        );
        self.current_bytes.fetch_add(byte_len, Ordering::Relaxed);
        self.enforce_budgets();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.remove_entry(key))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.manifest.iter().map(|e| e.key().clone()).collect())
    }

    async fn clear(&self) -> Result<usize> {
        let keys: Vec<String> = self.manifest.iter().map(|e| e.key().clone()).collect();
        let dropped = keys.len();
        for key in keys {
            self.remove_entry(&key);
        }
        self.current_bytes.store(0, Ordering::Relaxed);
        Ok(dropped)
    }

    async fn sweep(&self) -> Result<usize> {
        let now = now_ms();
        let expired: Vec<String> = self
            .manifest
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            if self.remove_entry(key) {
                self.counters.evict();
            }
        }
        Ok(expired.len())
    }

    fn stats(&self) -> LevelStats {
        LevelStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: self.manifest.len(),
            size_bytes: self.current_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> DiskCache<Vec<u32>> {
        DiskCache::open(DiskCacheConfig::new(dir)).unwrap()
    }

    #[tokio::test]
    async fn round_trip_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        c.set("q:1", &vec![1, 2, 3], None).await.unwrap();
        assert_eq!(c.get("q:1").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(c.get("q:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let c = open(dir.path());
            c.set("persist", &vec![9, 9], None).await.unwrap();
        }
        let c = open(dir.path());
        assert_eq!(c.get("persist").await.unwrap(), Some(vec![9, 9]));
        assert_eq!(c.stats().entries, 1);
    }

    #[tokio::test]
    async fn ttl_expiry_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let c = open(dir.path());
        c.set("brief", &vec![1], Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(c.get("brief").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_file_is_dropped_on_rescan() {
        let dir = tempfile::tempdir().unwrap();
        {
            let c = open(dir.path());
            c.set("ok", &vec![1], None).await.unwrap();
        }
        // Corrupt a shard by hand.
        std::fs::create_dir_all(dir.path().join("zz")).unwrap();
        std::fs::write(dir.path().join("zz/garbage.bin"), b"not bincode").unwrap();

        let c = open(dir.path());
        assert_eq!(c.stats().entries, 1);
        assert_eq!(c.get("ok").await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn entry_budget_evicts_lru() {
        let dir = tempfile::tempdir().unwrap();
        let c: DiskCache<Vec<u32>> = DiskCache::open(DiskCacheConfig {
            dir: dir.path().to_path_buf(),
            max_entries: 2,
            max_bytes: u64::MAX,
        })
        .unwrap();
        c.set("a", &vec![1], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        c.set("b", &vec![2], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        c.set("c", &vec![3], None).await.unwrap();

        assert_eq!(c.stats().entries, 2);
        assert_eq!(c.get("a").await.unwrap(), None);
    }
}
