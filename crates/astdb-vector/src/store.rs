//! Durable node/embedding/label storage on a single-file ACID store.
//!
//! Every public call is one transaction: either the change is durable on
//! return or an error is raised. Labels are handed out monotonically and
//! never reused, even after deletes.

use astdb_core::{
    AstDbError, BatchFailure, BatchOutcome, Label, NodeId, Result, VectorMetadata,
    VectorMetadataPatch, VectorRecord,
};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
const LABELS: TableDefinition<&str, u64> = TableDefinition::new("labels");
const LABELS_REV: TableDefinition<u64, &str> = TableDefinition::new("labels_rev");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_DIMENSIONS: &str = "dimensions";
const META_NEXT_LABEL: &str = "next_label";

/// Persisted `node_id ↔ label` bijection plus the watermark.
#[derive(Debug, Clone, Default)]
pub struct LabelMappings {
    pub by_node: BTreeMap<NodeId, Label>,
    pub next_label: Label,
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub count: usize,
    pub dimensions: usize,
    pub file_size_bytes: u64,
}

pub struct MetadataStore {
    db: Database,
    path: PathBuf,
    dimensions: usize,
}

fn storage_err(e: impl std::fmt::Display) -> AstDbError {
    AstDbError::Storage(e.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| AstDbError::CorruptMetadata(format!("encode: {}", e)))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| AstDbError::CorruptMetadata(format!("decode: {}", e)))
}

impl MetadataStore {
    /// Open or create the store. The embedding dimension is fixed here for
    /// the lifetime of the file; reopening with a different dimension
    /// fails.
    pub fn open(path: &Path, dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(AstDbError::InvalidDimension(
                "dimensions must be at least 1".to_string(),
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(storage_err)?;

        let txn = db.begin_write().map_err(storage_err)?;
        {
            let mut meta = txn.open_table(META).map_err(storage_err)?;
            let existing = meta
                .get(META_DIMENSIONS)
                .map_err(storage_err)?
                .map(|g| g.value() as usize);
            match existing {
                Some(existing) => {
                    if existing != dimensions {
                        return Err(AstDbError::DimensionMismatch {
                            expected: existing,
                            actual: dimensions,
                        });
                    }
                }
                None => {
                    meta.insert(META_DIMENSIONS, dimensions as u64)
                        .map_err(storage_err)?;
                    meta.insert(META_NEXT_LABEL, 0u64).map_err(storage_err)?;
                }
            }
            // Ensure all tables exist so reads never race table creation.
            txn.open_table(NODES).map_err(storage_err)?;
            txn.open_table(LABELS).map_err(storage_err)?;
            txn.open_table(LABELS_REV).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;

        info!("metadata store open at {} (dim {})", path.display(), dimensions);
        Ok(Self {
            db,
            path: path.to_path_buf(),
            dimensions,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(AstDbError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    pub fn insert_vector(
        &self,
        node_id: &str,
        embedding: Vec<f32>,
        metadata: VectorMetadata,
    ) -> Result<Label> {
        self.check_dimension(&embedding)?;

        let txn = self.db.begin_write().map_err(storage_err)?;
        let label;
        {
            let mut nodes = txn.open_table(NODES).map_err(storage_err)?;
            if nodes.get(node_id).map_err(storage_err)?.is_some() {
                return Err(AstDbError::DuplicateNodeId(node_id.to_string()));
            }

            let mut meta = txn.open_table(META).map_err(storage_err)?;
            label = meta
                .get(META_NEXT_LABEL)
                .map_err(storage_err)?
                .map(|g| g.value())
                .unwrap_or(0);
            meta.insert(META_NEXT_LABEL, label + 1).map_err(storage_err)?;

            let record = VectorRecord {
                node_id: node_id.to_string(),
                label,
                embedding,
                metadata,
                inserted_at: chrono::Utc::now(),
            };
            nodes
                .insert(node_id, encode(&record)?.as_slice())
                .map_err(storage_err)?;

            let mut labels = txn.open_table(LABELS).map_err(storage_err)?;
            labels.insert(node_id, label).map_err(storage_err)?;
            let mut rev = txn.open_table(LABELS_REV).map_err(storage_err)?;
            rev.insert(label, node_id).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        debug!("inserted {} as label {}", node_id, label);
        Ok(label)
    }

    /// Best-effort batch insert inside a single transaction. Per-item
    /// validation and duplicate failures are collected, not fatal;
    /// `success_count + failure_count` always equals the batch size.
    pub fn insert_vectors(
        &self,
        items: Vec<(NodeId, Vec<f32>, VectorMetadata)>,
    ) -> Result<(BatchOutcome, Vec<(NodeId, Label)>)> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        let mut outcome = BatchOutcome::default();
        let mut assigned = Vec::new();
        {
            let mut nodes = txn.open_table(NODES).map_err(storage_err)?;
            let mut labels = txn.open_table(LABELS).map_err(storage_err)?;
            let mut rev = txn.open_table(LABELS_REV).map_err(storage_err)?;
            let mut meta = txn.open_table(META).map_err(storage_err)?;
            let mut next_label = meta
                .get(META_NEXT_LABEL)
                .map_err(storage_err)?
                .map(|g| g.value())
                .unwrap_or(0);

            for (node_id, embedding, metadata) in items {
                if let Err(e) = self.check_dimension(&embedding) {
                    outcome.failure_count += 1;
                    outcome.failures.push(BatchFailure { node_id, error: e });
                    continue;
                }
                if nodes.get(node_id.as_str()).map_err(storage_err)?.is_some() {
                    outcome.failure_count += 1;
                    outcome.failures.push(BatchFailure {
                        error: AstDbError::DuplicateNodeId(node_id.clone()),
                        node_id,
                    });
                    continue;
                }
                let label = next_label;
                next_label += 1;
                let record = VectorRecord {
                    node_id: node_id.clone(),
                    label,
                    embedding,
                    metadata,
                    inserted_at: chrono::Utc::now(),
                };
                nodes
                    .insert(node_id.as_str(), encode(&record)?.as_slice())
                    .map_err(storage_err)?;
                labels.insert(node_id.as_str(), label).map_err(storage_err)?;
                rev.insert(label, node_id.as_str()).map_err(storage_err)?;
                outcome.success_count += 1;
                assigned.push((node_id, label));
            }
            meta.insert(META_NEXT_LABEL, next_label).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        Ok((outcome, assigned))
    }

    pub fn get_vector(&self, node_id: &str) -> Result<Option<VectorRecord>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let nodes = txn.open_table(NODES).map_err(storage_err)?;
        match nodes.get(node_id).map_err(storage_err)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_vectors(&self, node_ids: &[NodeId]) -> Result<HashMap<NodeId, VectorRecord>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let nodes = txn.open_table(NODES).map_err(storage_err)?;
        let mut out = HashMap::with_capacity(node_ids.len());
        for node_id in node_ids {
            if let Some(guard) = nodes.get(node_id.as_str()).map_err(storage_err)? {
                out.insert(node_id.clone(), decode(guard.value())?);
            }
        }
        Ok(out)
    }

    /// Replace the embedding and/or merge metadata fields. The label is
    /// preserved; unspecified metadata fields keep their values.
    pub fn update_vector(
        &self,
        node_id: &str,
        embedding: Option<Vec<f32>>,
        patch: Option<VectorMetadataPatch>,
    ) -> Result<VectorRecord> {
        if let Some(embedding) = &embedding {
            self.check_dimension(embedding)?;
        }

        let txn = self.db.begin_write().map_err(storage_err)?;
        let updated;
        {
            let mut nodes = txn.open_table(NODES).map_err(storage_err)?;
            let mut record: VectorRecord = match nodes.get(node_id).map_err(storage_err)? {
                Some(guard) => decode(guard.value())?,
                None => return Err(AstDbError::NotFound(node_id.to_string())),
            };
            if let Some(embedding) = embedding {
                record.embedding = embedding;
            }
            if let Some(patch) = patch {
                record.metadata.apply_patch(&patch);
            } else {
                record.metadata.last_updated = chrono::Utc::now();
            }
            nodes
                .insert(node_id, encode(&record)?.as_slice())
                .map_err(storage_err)?;
            updated = record;
        }
        txn.commit().map_err(storage_err)?;
        Ok(updated)
    }

    /// Remove a node. Absent ids are a no-op returning `false`; the label
    /// watermark is untouched so the label is never reissued.
    pub fn delete_vector(&self, node_id: &str) -> Result<Option<Label>> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        let removed;
        {
            let mut nodes = txn.open_table(NODES).map_err(storage_err)?;
            removed = match nodes.remove(node_id).map_err(storage_err)? {
                Some(guard) => {
                    let record: VectorRecord = decode(guard.value())?;
                    Some(record.label)
                }
                None => None,
            };
            if let Some(label) = removed {
                let mut labels = txn.open_table(LABELS).map_err(storage_err)?;
                labels.remove(node_id).map_err(storage_err)?;
                let mut rev = txn.open_table(LABELS_REV).map_err(storage_err)?;
                rev.remove(label).map_err(storage_err)?;
            }
        }
        txn.commit().map_err(storage_err)?;
        Ok(removed)
    }

    pub fn get_label_mappings(&self) -> Result<LabelMappings> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let labels = txn.open_table(LABELS).map_err(storage_err)?;
        let mut by_node = BTreeMap::new();
        for entry in labels.iter().map_err(storage_err)? {
            let (key, value) = entry.map_err(storage_err)?;
            by_node.insert(key.value().to_string(), value.value());
        }
        let meta = txn.open_table(META).map_err(storage_err)?;
        let next_label = meta
            .get(META_NEXT_LABEL)
            .map_err(storage_err)?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(LabelMappings {
            by_node,
            next_label,
        })
    }

    pub fn node_id_for_label(&self, label: Label) -> Result<Option<NodeId>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let rev = txn.open_table(LABELS_REV).map_err(storage_err)?;
        Ok(rev
            .get(label)
            .map_err(storage_err)?
            .map(|g| g.value().to_string()))
    }

    pub fn get_search_metadata(
        &self,
        node_ids: &[NodeId],
    ) -> Result<HashMap<NodeId, VectorMetadata>> {
        Ok(self
            .get_vectors(node_ids)?
            .into_iter()
            .map(|(id, record)| (id, record.metadata))
            .collect())
    }

    /// All live records sorted by ascending label; the rebuild path inserts
    /// them in exactly this order.
    pub fn all_records_by_label(&self) -> Result<Vec<VectorRecord>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let nodes = txn.open_table(NODES).map_err(storage_err)?;
        let mut records = Vec::new();
        for entry in nodes.iter().map_err(storage_err)? {
            let (_, value) = entry.map_err(storage_err)?;
            records.push(decode::<VectorRecord>(value.value())?);
        }
        records.sort_by_key(|r| r.label);
        Ok(records)
    }

    pub fn get_stats(&self) -> Result<StoreStats> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let nodes = txn.open_table(NODES).map_err(storage_err)?;
        let count = nodes.len().map_err(storage_err)? as usize;
        let file_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(StoreStats {
            count,
            dimensions: self.dimensions,
            file_size_bytes,
        })
    }

    /// Flush and close. Dropping the store does the same; this exists so
    /// shutdown order can be explicit.
    pub fn shutdown(self) {}
}
