//! Vector database façade: joins the metadata store and the HNSW index,
//! enforces their invariants, and owns the label ↔ node-id mapping.
//!
//! Reads run against whatever index `ArcSwap` currently points at; a
//! rebuild constructs the replacement off to the side and swaps it in with
//! one atomic pointer store, so no search ever observes a half-built
//! graph.

use crate::hnsw::{write_index_bytes, HnswIndex, Space, INDEX_FORMAT_VERSION};
use crate::store::{LabelMappings, MetadataStore};
use arc_swap::ArcSwap;
use astdb_core::{
    AstDbError, BatchFailure, BatchOutcome, EngineEvent, EventBus, IndexParams, IndexStatus,
    Label, NodeId, RebuildHook, Result, SearchResult, VectorMetadata, VectorMetadataPatch,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct VectorDbConfig {
    pub dimensions: usize,
    pub max_elements: usize,
    pub index_params: IndexParams,
    pub space: Space,
    pub storage_file: PathBuf,
    pub index_file: PathBuf,
    pub auto_save: bool,
    pub save_interval_s: u64,
    /// In-flight embedding budget for batch inserts; callers above it
    /// block until drainage.
    pub max_in_flight_inserts: usize,
    pub seed: u64,
}

impl VectorDbConfig {
    pub fn new(dimensions: usize, storage_file: PathBuf, index_file: PathBuf) -> Self {
        Self {
            dimensions,
            max_elements: 10_000,
            index_params: IndexParams::default(),
            space: Space::Cosine,
            storage_file,
            index_file,
            auto_save: false,
            save_interval_s: 300,
            max_in_flight_inserts: 256,
            seed: 0x5eed,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(AstDbError::InvalidDimension(
                "dimensions must be at least 1".to_string(),
            ));
        }
        if self.max_elements == 0 {
            return Err(AstDbError::InvalidConfig(
                "max_elements must be greater than zero".to_string(),
            ));
        }
        self.index_params.validate()
    }
}

/// Sidecar `index.meta.json`, written after every successful save.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexMeta {
    pub version: u32,
    pub dimensions: u32,
    pub space: String,
    pub count: u64,
    pub next_label: u64,
    pub last_saved: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub count: usize,
    pub capacity: usize,
    pub dimensions: usize,
    pub status: IndexStatus,
    pub index_version: u64,
    pub storage_file_bytes: u64,
    pub index_file_bytes: u64,
    pub estimated_memory_bytes: usize,
    pub average_search_ms: f64,
    pub last_saved: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
pub struct RebuildReport {
    pub previous_count: u64,
    pub new_count: u64,
    pub duration: Duration,
}

pub struct VectorDatabase {
    config: VectorDbConfig,
    store: Arc<MetadataStore>,
    index: ArcSwap<RwLock<HnswIndex>>,
    node_by_label: DashMap<Label, NodeId>,
    status: RwLock<IndexStatus>,
    index_version: AtomicU64,
    rebuild_hook: RwLock<Option<Arc<dyn RebuildHook>>>,
    events: Arc<EventBus>,
    insert_gate: Arc<Semaphore>,
    save_in_flight: Arc<AtomicBool>,
    search_ms: Mutex<(f64, u64)>,
    last_saved: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl VectorDatabase {
    /// Open both halves and reconcile them. Fails when the persisted label
    /// mappings disagree with the index contents; a missing index file is
    /// not a disagreement — the graph is rebuilt from the store.
    pub async fn initialize(config: VectorDbConfig, events: Arc<EventBus>) -> Result<Arc<Self>> {
        config.validate()?;

        let store_path = config.storage_file.clone();
        let dimensions = config.dimensions;
        let store = tokio::task::spawn_blocking(move || MetadataStore::open(&store_path, dimensions))
            .await
            .map_err(|e| AstDbError::Storage(format!("store open panicked: {}", e)))??;
        let store = Arc::new(store);

        let mappings = {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || store.get_label_mappings())
                .await
                .map_err(|e| AstDbError::Storage(format!("mapping read panicked: {}", e)))??
        };

        let index = if config.index_file.exists() {
            let path = config.index_file.clone();
            let loaded = tokio::task::spawn_blocking(move || HnswIndex::load(&path))
                .await
                .map_err(|e| AstDbError::Index(format!("index load panicked: {}", e)))??;
            Self::reconcile(&loaded, &mappings, &config)?;
            loaded
        } else {
            Self::build_from_store(&store, &config, None).await?
        };

        let node_by_label = DashMap::new();
        for (node_id, label) in &mappings.by_node {
            node_by_label.insert(*label, node_id.clone());
        }

        let db = Arc::new(Self {
            insert_gate: Arc::new(Semaphore::new(config.max_in_flight_inserts)),
            config,
            store,
            index: ArcSwap::from_pointee(RwLock::new(index)),
            node_by_label,
            status: RwLock::new(IndexStatus::Ready),
            index_version: AtomicU64::new(1),
            rebuild_hook: RwLock::new(None),
            events,
            save_in_flight: Arc::new(AtomicBool::new(false)),
            search_ms: Mutex::new((0.0, 0)),
            last_saved: Mutex::new(None),
        });

        if db.config.auto_save {
            db.clone().spawn_auto_save();
        }
        Ok(db)
    }

    fn reconcile(index: &HnswIndex, mappings: &LabelMappings, config: &VectorDbConfig) -> Result<()> {
        if index.dimensions() != config.dimensions {
            return Err(AstDbError::IndexFormatIncompatible(format!(
                "index dimension {} vs configured {}",
                index.dimensions(),
                config.dimensions
            )));
        }
        if index.count() != mappings.by_node.len() {
            return Err(AstDbError::CorruptMetadata(format!(
                "index holds {} live labels, store maps {}",
                index.count(),
                mappings.by_node.len()
            )));
        }
        for (node_id, label) in &mappings.by_node {
            if !index.contains(*label) {
                return Err(AstDbError::CorruptMetadata(format!(
                    "label {} ({}) mapped but missing from index",
                    label, node_id
                )));
            }
        }
        Ok(())
    }

    async fn build_from_store(
        store: &Arc<MetadataStore>,
        config: &VectorDbConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<HnswIndex> {
        let records = {
            let store = Arc::clone(store);
            tokio::task::spawn_blocking(move || store.all_records_by_label())
                .await
                .map_err(|e| AstDbError::Storage(format!("record scan panicked: {}", e)))??
        };

        let capacity = config.max_elements.max(records.len() + records.len() / 4 + 1);
        let mut index = HnswIndex::new(
            config.dimensions,
            config.space,
            config.index_params.m,
            config.index_params.ef_construction,
            config.index_params.ef,
            capacity,
            config.seed,
        )?;
        for (i, record) in records.into_iter().enumerate() {
            if i % 256 == 0 {
                if let Some(cancel) = cancel {
                    if cancel.is_cancelled() {
                        return Err(AstDbError::Cancelled);
                    }
                }
            }
            index.add(record.label, record.embedding)?;
        }
        Ok(index)
    }

    pub fn set_rebuild_hook(&self, hook: Arc<dyn RebuildHook>) {
        *self.rebuild_hook.write() = Some(hook);
    }

    pub fn status(&self) -> IndexStatus {
        *self.status.read()
    }

    /// Monotonic version bumped on every rebuild; query cache keys include
    /// it so a rebuilt index never serves stale cached results.
    pub fn index_version(&self) -> u64 {
        self.index_version.load(Ordering::Acquire)
    }

    fn refuse_if_unhealthy(&self) -> Result<()> {
        if self.status() == IndexStatus::Error {
            return Err(AstDbError::NotInitialized(
                "vector database is in error state; rebuild required".to_string(),
            ));
        }
        Ok(())
    }

    fn enter_error(&self, cause: &AstDbError) {
        error!("vector database entering error state: {}", cause);
        *self.status.write() = IndexStatus::Error;
    }

    pub async fn insert_vector(
        &self,
        node_id: &str,
        embedding: Vec<f32>,
        metadata: VectorMetadata,
    ) -> Result<Label> {
        self.refuse_if_unhealthy()?;

        let label = {
            let store = Arc::clone(&self.store);
            let node_id = node_id.to_string();
            let embedding_for_store = embedding.clone();
            tokio::task::spawn_blocking(move || {
                store.insert_vector(&node_id, embedding_for_store, metadata)
            })
            .await
            .map_err(|e| AstDbError::Storage(format!("insert panicked: {}", e)))??
        };

        self.index_add(label, embedding).await?;
        self.node_by_label.insert(label, node_id.to_string());
        Ok(label)
    }

    /// Write-through to the index under a short exclusive lock; a full
    /// index triggers a rebuild into larger capacity, then one retry.
    async fn index_add(&self, label: Label, embedding: Vec<f32>) -> Result<()> {
        let attempt = {
            let guard = self.index.load();
            let mut index = guard.write();
            index.add(label, embedding.clone())
        };
        match attempt {
            Err(AstDbError::IndexFull(_)) => {
                warn!("index full at label {}, rebuilding into larger capacity", label);
                self.rebuild(&CancellationToken::new()).await?;
                // The row was already durable, so the rebuild usually picks
                // it up; only add again if it did not.
                let guard = self.index.load();
                let mut index = guard.write();
                if index.contains(label) {
                    Ok(())
                } else {
                    index.add(label, embedding)
                }
            }
            other => other,
        }
    }

    /// Best-effort batch. Admission is throttled by the in-flight budget;
    /// item failures are reported per node id, not raised.
    pub async fn insert_vectors(
        &self,
        items: Vec<(NodeId, Vec<f32>, VectorMetadata)>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        self.refuse_if_unhealthy()?;
        if cancel.is_cancelled() {
            return Err(AstDbError::Cancelled);
        }

        let permits = (items.len() as u32).min(self.config.max_in_flight_inserts as u32).max(1);
        let _permits = self
            .insert_gate
            .acquire_many(permits)
            .await
            .map_err(|_| AstDbError::Cancelled)?;

        let embeddings: std::collections::HashMap<NodeId, Vec<f32>> = items
            .iter()
            .map(|(id, e, _)| (id.clone(), e.clone()))
            .collect();

        let (mut outcome, assigned) = {
            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || store.insert_vectors(items))
                .await
                .map_err(|e| AstDbError::Storage(format!("batch insert panicked: {}", e)))??
        };

        for (node_id, label) in assigned {
            if cancel.is_cancelled() {
                // Already-durable rows stay; the index entries for the
                // remainder are added on the next rebuild. Roll the
                // in-memory half back by tombstoning nothing: report
                // cancellation so the caller retries.
                return Err(AstDbError::Cancelled);
            }
            let Some(embedding) = embeddings.get(&node_id).cloned() else {
                outcome.success_count -= 1;
                outcome.failure_count += 1;
                outcome.failures.push(BatchFailure {
                    error: AstDbError::NotFound(node_id.clone()),
                    node_id,
                });
                continue;
            };
            match self.index_add(label, embedding).await {
                Ok(()) => {
                    self.node_by_label.insert(label, node_id);
                }
                Err(e) => {
                    outcome.success_count -= 1;
                    outcome.failure_count += 1;
                    outcome.failures.push(BatchFailure { node_id, error: e });
                }
            }
        }
        Ok(outcome)
    }

    pub async fn update_vector(
        &self,
        node_id: &str,
        embedding: Option<Vec<f32>>,
        patch: Option<VectorMetadataPatch>,
    ) -> Result<()> {
        self.refuse_if_unhealthy()?;

        let updated = {
            let store = Arc::clone(&self.store);
            let node_id = node_id.to_string();
            let embedding = embedding.clone();
            tokio::task::spawn_blocking(move || store.update_vector(&node_id, embedding, patch))
                .await
                .map_err(|e| AstDbError::Storage(format!("update panicked: {}", e)))??
        };

        if let Some(embedding) = embedding {
            let guard = self.index.load();
            let mut index = guard.write();
            index.update(updated.label, embedding)?;
        }
        Ok(())
    }

    pub async fn delete_vector(&self, node_id: &str) -> Result<bool> {
        self.refuse_if_unhealthy()?;

        let removed = {
            let store = Arc::clone(&self.store);
            let node_id = node_id.to_string();
            tokio::task::spawn_blocking(move || store.delete_vector(&node_id))
                .await
                .map_err(|e| AstDbError::Storage(format!("delete panicked: {}", e)))??
        };

        match removed {
            Some(label) => {
                let guard = self.index.load();
                guard.write().mark_deleted(label);
                self.node_by_label.remove(&label);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// k-NN search joined with stored metadata. Results arrive in ascending
    /// distance order with ascending-label tie-breaks; scores are mapped
    /// into `[0, 1]` per space.
    pub async fn search_similar(
        &self,
        query: &[f32],
        k: Option<usize>,
        ef: Option<usize>,
    ) -> Result<Vec<SearchResult>> {
        if self.status() == IndexStatus::Error {
            return Err(AstDbError::Index(
                "index unhealthy; rebuild required".to_string(),
            ));
        }
        let k = k.unwrap_or(10);
        let started = Instant::now();

        let labeled = {
            let guard = self.index.load_full();
            let index = guard.read();
            index.search(query, k, ef)?
        };

        let node_ids: Vec<NodeId> = labeled
            .iter()
            .filter_map(|(label, _)| self.node_by_label.get(label).map(|e| e.value().clone()))
            .collect();
        let metadata = {
            let store = Arc::clone(&self.store);
            let ids = node_ids.clone();
            tokio::task::spawn_blocking(move || store.get_search_metadata(&ids))
                .await
                .map_err(|e| AstDbError::Storage(format!("metadata join panicked: {}", e)))??
        };

        let space = self.config.space;
        let mut results = Vec::with_capacity(labeled.len());
        for (label, distance) in labeled {
            let Some(node_id) = self.node_by_label.get(&label).map(|e| e.value().clone()) else {
                continue;
            };
            let Some(meta) = metadata.get(&node_id) else {
                continue;
            };
            results.push(SearchResult {
                node_id,
                distance,
                score: score_for(space, distance),
                metadata: meta.clone(),
                vector: None,
            });
        }

        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        let mut stats = self.search_ms.lock();
        stats.0 += elapsed;
        stats.1 += 1;

        Ok(results)
    }

    /// Reconstruct the graph from the metadata store into a fresh index of
    /// capacity ≥ 1.25× the live count, inserted in label order, and swap
    /// it in atomically. Rebuild is also the prescribed recovery from the
    /// `error` state.
    pub async fn rebuild(&self, cancel: &CancellationToken) -> Result<RebuildReport> {
        let started = Instant::now();
        let previous_count = {
            let guard = self.index.load();
            let count = guard.read().count() as u64;
            count
        };
        *self.status.write() = IndexStatus::Rebuilding;

        let built = Self::build_from_store(&self.store, &self.config, Some(cancel)).await;
        let new_index = match built {
            Ok(index) => index,
            Err(e) => {
                if matches!(e, AstDbError::Cancelled) {
                    *self.status.write() = IndexStatus::Ready;
                } else {
                    self.enter_error(&e);
                }
                return Err(e);
            }
        };
        let new_count = new_index.count() as u64;

        let mappings = {
            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || store.get_label_mappings())
                .await
                .map_err(|e| AstDbError::Storage(format!("mapping read panicked: {}", e)))??
        };

        // Single atomic pointer swap; concurrent reads keep the old graph.
        self.index.store(Arc::new(RwLock::new(new_index)));
        self.node_by_label.clear();
        for (node_id, label) in &mappings.by_node {
            self.node_by_label.insert(*label, node_id.clone());
        }

        self.index_version.fetch_add(1, Ordering::AcqRel);
        *self.status.write() = IndexStatus::Ready;

        let duration = started.elapsed();
        if let Some(hook) = self.rebuild_hook.read().clone() {
            hook.on_index_rebuild(previous_count, new_count);
        }
        self.events.emit(EngineEvent::IndexRebuilt {
            previous_count,
            new_count,
            duration_ms: duration.as_millis() as u64,
        });
        info!(
            "rebuild complete: {} -> {} vectors in {:?}",
            previous_count, new_count, duration
        );

        Ok(RebuildReport {
            previous_count,
            new_count,
            duration,
        })
    }

    /// Persist the index. Skips (returning `false`) while a previous save
    /// is still in flight. The graph is snapshotted under a read lock; the
    /// disk write happens lock-free.
    pub async fn save(&self) -> Result<bool> {
        if self
            .save_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        let result = self.save_inner().await;
        self.save_in_flight.store(false, Ordering::Release);
        result.map(|_| true)
    }

    async fn save_inner(&self) -> Result<()> {
        let (bytes, count, next_label) = {
            let guard = self.index.load_full();
            let index = guard.read();
            (index.to_bytes()?, index.count() as u64, index.label_watermark())
        };
        let index_path = self.config.index_file.clone();
        tokio::task::spawn_blocking(move || write_index_bytes(&bytes, &index_path))
            .await
            .map_err(|e| AstDbError::Index(format!("save panicked: {}", e)))??;

        let now = chrono::Utc::now();
        let meta = IndexMeta {
            version: INDEX_FORMAT_VERSION,
            dimensions: self.config.dimensions as u32,
            space: self.config.space.to_string(),
            count,
            next_label,
            last_saved: now,
        };
        let meta_path = self.config.index_file.with_file_name("index.meta.json");
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?).await?;
        *self.last_saved.lock() = Some(now);
        Ok(())
    }

    fn spawn_auto_save(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.save_interval_s.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.save().await {
                    Ok(true) => {}
                    Ok(false) => warn!("periodic save skipped; previous save still running"),
                    Err(e) => warn!("periodic save failed: {}", e),
                }
            }
        });
    }

    /// Exact lookup by node id.
    pub async fn get_vector(&self, node_id: &str) -> Result<Option<astdb_core::VectorRecord>> {
        let store = Arc::clone(&self.store);
        let node_id = node_id.to_string();
        tokio::task::spawn_blocking(move || store.get_vector(&node_id))
            .await
            .map_err(|e| AstDbError::Storage(format!("lookup panicked: {}", e)))?
    }

    pub async fn get_vectors(
        &self,
        node_ids: Vec<NodeId>,
    ) -> Result<std::collections::HashMap<NodeId, astdb_core::VectorRecord>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.get_vectors(&node_ids))
            .await
            .map_err(|e| AstDbError::Storage(format!("lookup panicked: {}", e)))?
    }

    pub async fn get_stats(&self) -> Result<DatabaseStats> {
        let (count, capacity, dimensions) = {
            let guard = self.index.load_full();
            let index = guard.read();
            (index.count(), index.capacity(), index.dimensions())
        };
        let store_stats = {
            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || store.get_stats())
                .await
                .map_err(|e| AstDbError::Storage(format!("stats panicked: {}", e)))??
        };
        let index_file_bytes = std::fs::metadata(&self.config.index_file)
            .map(|m| m.len())
            .unwrap_or(0);
        let (total_ms, searches) = *self.search_ms.lock();
        Ok(DatabaseStats {
            count,
            capacity,
            dimensions,
            status: self.status(),
            index_version: self.index_version(),
            storage_file_bytes: store_stats.file_size_bytes,
            index_file_bytes,
            estimated_memory_bytes: count * dimensions * std::mem::size_of::<f32>(),
            average_search_ms: if searches == 0 {
                0.0
            } else {
                total_ms / searches as f64
            },
            last_saved: *self.last_saved.lock(),
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.save().await?;
        Ok(())
    }
}

/// Distance-to-score mapping per space. Cosine clamps into `[0, 1]` (a
/// zero vector's defined distance of 1.0 scores 0); inner-product runs
/// through a sigmoid on the negated distance so higher similarity still
/// means higher score.
pub fn score_for(space: Space, distance: f32) -> f32 {
    match space {
        Space::L2 => 1.0 / (1.0 + distance),
        Space::Cosine => (1.0 - distance).clamp(0.0, 1.0),
        Space::Ip => 1.0 / (1.0 + (distance as f64).exp()) as f32,
    }
}
