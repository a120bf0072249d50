use crate::{AstDbError, Result};
use serde::{Deserialize, Serialize};

/// HNSW tunables. Ranges are enforced at validation time: `m` in 4..=64,
/// `ef_construction` in 16..=800, `ef` in 16..=512.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef: 64,
        }
    }
}

impl IndexParams {
    pub fn validate(&self) -> Result<()> {
        if !(4..=64).contains(&self.m) {
            return Err(AstDbError::InvalidConfig(format!(
                "index_params.M must be within 4..=64, got {}",
                self.m
            )));
        }
        if !(16..=800).contains(&self.ef_construction) {
            return Err(AstDbError::InvalidConfig(format!(
                "index_params.efConstruction must be within 16..=800, got {}",
                self.ef_construction
            )));
        }
        if !(16..=512).contains(&self.ef) {
            return Err(AstDbError::InvalidConfig(format!(
                "index_params.ef must be within 16..=512, got {}",
                self.ef
            )));
        }
        Ok(())
    }
}

/// Engine-wide configuration, deserialized from `.astdb/config.json` by the
/// owning collaborator and passed in whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Files considered by the parse coordinator.
    pub parse_glob: Vec<String>,
    /// Files ignored even when matched by `parse_glob`.
    pub exclude_glob: Vec<String>,
    /// Reparse triggers for the file watcher.
    pub watch_glob: Vec<String>,
    /// Coalescing window for watch events.
    pub watch_debounce_ms: u64,
    /// Default search fan-out.
    pub top_k: usize,
    /// Code snippet window attached to results.
    pub snippet_lines: usize,
    pub index_params: IndexParams,
    /// Embedder selection; the engine only sees the capability.
    pub model_name: String,
    pub model_host: Option<String>,
    pub batch_size: usize,
    /// Worker count for the parse and embed pipelines; 0 means the number
    /// of available cores.
    pub concurrency: usize,
    /// Soft memory ceiling; tripping it shrinks caches, then applies
    /// backpressure.
    pub max_memory_mb: usize,
    pub enable_telemetry: bool,
    pub enable_native: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parse_glob: vec!["**/*".to_string()],
            exclude_glob: vec![
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
                "**/.git/**".to_string(),
            ],
            watch_glob: Vec::new(),
            watch_debounce_ms: 250,
            top_k: 10,
            snippet_lines: 8,
            index_params: IndexParams::default(),
            model_name: "default".to_string(),
            model_host: None,
            batch_size: 32,
            concurrency: 0,
            max_memory_mb: 1024,
            enable_telemetry: false,
            enable_native: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.index_params.validate()?;
        if self.batch_size == 0 {
            return Err(AstDbError::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.watch_debounce_ms == 0 {
            return Err(AstDbError::InvalidConfig(
                "watch_debounce_ms must be greater than zero".to_string(),
            ));
        }
        if self.parse_glob.is_empty() {
            return Err(AstDbError::InvalidConfig(
                "parse_glob must name at least one pattern".to_string(),
            ));
        }
        Ok(())
    }

    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            num_cpus::get()
        } else {
            self.concurrency
        }
    }
}
