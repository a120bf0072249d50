//! L3: embedded relational store backing both the cache and the query
//! log. One writer connection behind a mutex; calls cross to the blocking
//! pool so the async executor never blocks on sqlite I/O.

use crate::entry::{CacheLevel, CacheStore, LevelCounters, LevelStats};
use astdb_core::{AstDbError, QueryLogRecord, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    key           TEXT PRIMARY KEY,
    value         BLOB NOT NULL,
    created_at_ms INTEGER NOT NULL,
    ttl_ms        INTEGER,
    last_accessed INTEGER NOT NULL,
    access_count  INTEGER NOT NULL DEFAULT 0,
    byte_size     INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS query_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    query_text    TEXT NOT NULL,
    query_hash    TEXT NOT NULL,
    options_json  TEXT NOT NULL,
    result_count  INTEGER NOT NULL,
    execution_ms  INTEGER NOT NULL,
    cache_hit     INTEGER NOT NULL,
    cache_level   TEXT,
    timestamp     TEXT NOT NULL,
    index_version INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_query_log_hash ON query_log(query_hash);
";

fn sql_err(e: impl std::fmt::Display) -> AstDbError {
    AstDbError::Cache(format!("sqlite: {}", e))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct TopQuery {
    pub query_text: String,
    pub executions: u64,
    pub average_ms: f64,
}

pub struct DatabaseCache<V> {
    conn: Arc<Mutex<Connection>>,
    counters: LevelCounters,
    _value: PhantomData<fn() -> V>,
}

impl<V> DatabaseCache<V>
where
    V: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sql_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        info!("l3 cache open at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            counters: LevelCounters::default(),
            _value: PhantomData,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            counters: LevelCounters::default(),
            _value: PhantomData,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(sql_err)?
    }

    pub async fn log_query(&self, record: QueryLogRecord) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO query_log (query_text, query_hash, options_json, result_count, \
                 execution_ms, cache_hit, cache_level, timestamp, index_version) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.query_text,
                    record.query_hash,
                    record.options_json,
                    record.result_count as i64,
                    record.execution_ms as i64,
                    record.cache_hit as i64,
                    record.cache_level,
                    record.timestamp.to_rfc3339(),
                    record.index_version as i64,
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    /// Most frequently executed query shapes, busiest first.
    pub async fn get_top_queries(&self, limit: usize) -> Result<Vec<TopQuery>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT query_text, COUNT(*) AS executions, AVG(execution_ms) \
                     FROM query_log GROUP BY query_hash \
                     ORDER BY executions DESC, query_text ASC LIMIT ?1",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(TopQuery {
                        query_text: row.get(0)?,
                        executions: row.get::<_, i64>(1)? as u64,
                        average_ms: row.get(2)?,
                    })
                })
                .map_err(sql_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(sql_err)?);
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl<V> CacheStore<V> for DatabaseCache<V>
where
    V: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    fn level(&self) -> CacheLevel {
        CacheLevel::L3
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        let owned = key.to_string();
        let row: Option<(Vec<u8>, i64, Option<i64>)> = self
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT value, created_at_ms, ttl_ms FROM cache_entries WHERE key = ?1",
                        params![owned.clone()],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()
                    .map_err(sql_err)?;
                if row.is_some() {
                    conn.execute(
                        "UPDATE cache_entries SET last_accessed = ?2, access_count = access_count + 1 \
                         WHERE key = ?1",
                        params![owned, now_ms()],
                    )
                    .map_err(sql_err)?;
                }
                Ok(row)
            })
            .await?;

        match row {
            Some((value, created_at_ms, ttl_ms)) => {
                let expired = ttl_ms
                    .map(|ttl| now_ms().saturating_sub(created_at_ms) > ttl)
                    .unwrap_or(false);
                if expired {
                    let _ = CacheStore::<V>::delete(self, key).await;
                    self.counters.evict();
                    self.counters.miss();
                    return Ok(None);
                }
                let decoded: V =
                    bincode::serde::decode_from_slice(&value, bincode::config::standard())
                        .map(|(v, _)| v)
                        .map_err(sql_err)?;
                self.counters.hit();
                Ok(Some(decoded))
            }
            None => {
                self.counters.miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &V, ttl: Option<Duration>) -> Result<()> {
        let key = key.to_string();
        let encoded = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(sql_err)?;
        self.with_conn(move |conn| {
            let size = encoded.len() as i64;
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries \
                 (key, value, created_at_ms, ttl_ms, last_accessed, access_count, byte_size) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![
                    key,
                    encoded,
                    now_ms(),
                    ttl.map(|d| d.as_millis() as i64),
                    now_ms(),
                    size,
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
                .map_err(sql_err)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key FROM cache_entries")
                .map_err(sql_err)?;
            let rows = stmt.query_map([], |row| row.get(0)).map_err(sql_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(sql_err)?);
            }
            Ok(out)
        })
        .await
    }

    async fn clear(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let dropped = conn
                .execute("DELETE FROM cache_entries", [])
                .map_err(sql_err)?;
            Ok(dropped)
        })
        .await
    }

    async fn sweep(&self) -> Result<usize> {
        let reaped = self
            .with_conn(|conn| {
                let reaped = conn
                    .execute(
                        "DELETE FROM cache_entries \
                         WHERE ttl_ms IS NOT NULL AND (?1 - created_at_ms) > ttl_ms",
                        params![now_ms()],
                    )
                    .map_err(sql_err)?;
                Ok(reaped)
            })
            .await?;
        for _ in 0..reaped {
            self.counters.evict();
        }
        Ok(reaped)
    }

    fn stats(&self) -> LevelStats {
        let (entries, size_bytes) = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(byte_size), 0) FROM cache_entries",
                [],
                |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as u64)),
            )
            .unwrap_or((0, 0))
        };
        LevelStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries,
            size_bytes,
        }
    }
}
