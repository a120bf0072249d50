pub mod database;
pub mod hnsw;
pub mod query;
pub mod store;

pub use database::{
    score_for, DatabaseStats, IndexMeta, RebuildReport, VectorDatabase, VectorDbConfig,
};
pub use hnsw::{HnswIndex, Space, INDEX_FORMAT_VERSION, INDEX_MAGIC};
pub use query::{QueryEngine, QueryOptions, QueryOutcome, QUERY_KIND_SEMANTIC};
pub use store::{LabelMappings, MetadataStore, StoreStats};
