use thiserror::Error;

#[derive(Error, Debug)]
pub enum AstDbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid dimension: {0}")]
    InvalidDimension(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index full: {0}")]
    IndexFull(String),

    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("Index format incompatible: {0}")]
    IndexFormatIncompatible(String),

    #[error("Corrupt metadata: {0}")]
    CorruptMetadata(String),

    #[error("Grammar digest mismatch for {grammar}: expected {expected}, got {actual}")]
    GrammarDigestMismatch {
        grammar: String,
        expected: String,
        actual: String,
    },

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Grammar unavailable: {0}")]
    GrammarUnavailable(String),

    #[error("Embedder failed: {0}")]
    EmbedderFailed(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Index error: {0}")]
    Index(String),
}

impl AstDbError {
    /// Integrity failures freeze the vector database façade until a
    /// successful rebuild.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            AstDbError::IndexFormatIncompatible(_)
                | AstDbError::CorruptMetadata(_)
                | AstDbError::GrammarDigestMismatch { .. }
        )
    }

    /// Resource failures are retried once at the cache and embedder
    /// boundaries; `Cancelled` is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AstDbError::Timeout(_) | AstDbError::ResourceExhausted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AstDbError>;
