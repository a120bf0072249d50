//! Query engine: cache-keyed semantic search in front of the vector
//! database façade.
//!
//! An unhealthy cache degrades to a direct façade search; an unhealthy
//! index fails loudly. Resource errors at the embedder boundary are
//! retried once with backoff, `Cancelled` never is.

use crate::database::VectorDatabase;
use astdb_cache::MultiLevelCache;
use astdb_core::{fingerprint, AstDbError, Embedder, QueryLogRecord, Result, SearchResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const QUERY_KIND_SEMANTIC: &str = "semantic";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub ef: Option<usize>,
    pub min_score: Option<f32>,
    pub file_path_regex: Option<String>,
    pub min_confidence: Option<f32>,
    pub include_vectors: bool,
}

impl QueryOptions {
    fn has_filters(&self) -> bool {
        self.min_score.is_some() || self.file_path_regex.is_some() || self.min_confidence.is_some()
    }
}

#[derive(Debug)]
pub struct QueryOutcome {
    pub results: Vec<SearchResult>,
    pub log: QueryLogRecord,
}

pub struct QueryEngine {
    database: Arc<VectorDatabase>,
    cache: Arc<MultiLevelCache<Vec<SearchResult>>>,
    embedder: Arc<dyn Embedder>,
    default_top_k: usize,
}

impl QueryEngine {
    pub fn new(
        database: Arc<VectorDatabase>,
        cache: Arc<MultiLevelCache<Vec<SearchResult>>>,
        embedder: Arc<dyn Embedder>,
        default_top_k: usize,
    ) -> Self {
        Self {
            database,
            cache,
            embedder,
            default_top_k,
        }
    }

    pub fn cache_key(&self, query_text: &str, options: &QueryOptions) -> String {
        let options_value =
            serde_json::to_value(options).unwrap_or(serde_json::Value::Null);
        fingerprint::query_key(
            QUERY_KIND_SEMANTIC,
            query_text,
            &options_value,
            self.database.index_version(),
        )
    }

    pub async fn search(&self, query_text: &str, options: QueryOptions) -> Result<QueryOutcome> {
        let started = Instant::now();
        let key = self.cache_key(query_text, &options);
        let options_json = serde_json::to_string(&options)?;

        let lookup = self.cache.get(&key).await;
        if let Some(results) = lookup.value {
            let log = QueryLogRecord {
                query_text: query_text.to_string(),
                query_hash: key.clone(),
                options_json,
                result_count: results.len(),
                execution_ms: started.elapsed().as_millis() as u64,
                cache_hit: true,
                cache_level: lookup.level.map(|l| l.to_string()),
                timestamp: chrono::Utc::now(),
                index_version: self.database.index_version(),
            };
            if let Err(e) = self.cache.log_query(log.clone()).await {
                warn!("query log write failed: {}", e);
            }
            debug!("cache hit for {} at {:?}", key, lookup.level);
            return Ok(QueryOutcome { results, log });
        }

        let embedding = self.embed_with_retry(query_text).await?;
        let top_k = options.top_k.unwrap_or(self.default_top_k);
        // Filters discard rows after the fact, so over-fetch when any are
        // set to keep top_k meaningful.
        let fetch_k = if options.has_filters() {
            top_k.saturating_mul(4).max(top_k)
        } else {
            top_k
        };
        let raw = self
            .database
            .search_similar(&embedding, Some(fetch_k), options.ef)
            .await?;
        let mut results = self.post_filter(raw, &options)?;
        results.truncate(top_k);

        if options.include_vectors {
            let ids: Vec<String> = results.iter().map(|r| r.node_id.clone()).collect();
            let records = self.database.get_vectors(ids).await?;
            for result in &mut results {
                result.vector = records.get(&result.node_id).map(|r| r.embedding.clone());
            }
        }

        let failed_levels = self.cache.set(&key, &results, None).await;
        if failed_levels > 0 {
            warn!("cache fill failed at {} levels for {}", failed_levels, key);
        }

        let log = QueryLogRecord {
            query_text: query_text.to_string(),
            query_hash: key,
            options_json,
            result_count: results.len(),
            execution_ms: started.elapsed().as_millis() as u64,
            cache_hit: false,
            cache_level: None,
            timestamp: chrono::Utc::now(),
            index_version: self.database.index_version(),
        };
        if let Err(e) = self.cache.log_query(log.clone()).await {
            warn!("query log write failed: {}", e);
        }
        Ok(QueryOutcome { results, log })
    }

    /// `search` bounded by a deadline; expiry surfaces as `Timeout` and
    /// abandons the in-flight work at its next checkpoint.
    pub async fn search_with_deadline(
        &self,
        query_text: &str,
        options: QueryOptions,
        deadline: Duration,
    ) -> Result<QueryOutcome> {
        tokio::time::timeout(deadline, self.search(query_text, options))
            .await
            .map_err(|_| AstDbError::Timeout(deadline))?
    }

    fn post_filter(
        &self,
        results: Vec<SearchResult>,
        options: &QueryOptions,
    ) -> Result<Vec<SearchResult>> {
        let path_re = match &options.file_path_regex {
            Some(raw) => Some(Regex::new(raw).map_err(|e| {
                AstDbError::InvalidConfig(format!("file_path_regex {}: {}", raw, e))
            })?),
            None => None,
        };
        Ok(results
            .into_iter()
            .filter(|r| {
                if let Some(min) = options.min_score {
                    if r.score < min {
                        return false;
                    }
                }
                if let Some(min) = options.min_confidence {
                    if r.metadata.confidence < min {
                        return false;
                    }
                }
                if let Some(re) = &path_re {
                    if !re.is_match(&r.metadata.file_path) {
                        return false;
                    }
                }
                true
            })
            .collect())
    }

    /// One retry with backoff for resource errors; anything else, and
    /// `Cancelled` in particular, surfaces immediately.
    async fn embed_with_retry(&self, query_text: &str) -> Result<Vec<f32>> {
        let texts = vec![query_text.to_string()];
        match self.embedder.embed(&texts).await {
            Ok(mut vectors) if !vectors.is_empty() => Ok(vectors.remove(0)),
            Ok(_) => Err(AstDbError::EmbedderFailed(
                "embedder returned no vectors".to_string(),
            )),
            Err(e) if e.is_retryable() => {
                warn!("embedder failed ({}), retrying once", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                let mut vectors = self.embedder.embed(&texts).await?;
                if vectors.is_empty() {
                    return Err(AstDbError::EmbedderFailed(
                        "embedder returned no vectors".to_string(),
                    ));
                }
                Ok(vectors.remove(0))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn top_queries(&self, limit: usize) -> Result<Vec<astdb_cache::TopQuery>> {
        self.cache.get_top_queries(limit).await
    }
}
