use crate::Result;
use async_trait::async_trait;

/// Capability through which the engine consumes verified embeddings. Model
/// acquisition, integrity checks, and batching internals belong to the
/// collaborator implementing this.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; the returned vectors all have `dimensions()`
    /// width. Zero vectors are valid outputs.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Hook invoked after a successful index rebuild; used by the cache manager
/// to invalidate query results that reference the previous index version.
pub trait RebuildHook: Send + Sync {
    fn on_index_rebuild(&self, previous_count: u64, new_count: u64);
}

impl<F> RebuildHook for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn on_index_rebuild(&self, previous_count: u64, new_count: u64) {
        self(previous_count, new_count)
    }
}
