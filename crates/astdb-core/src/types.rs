use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Content-addressed node identifier (hex encoded SHA-256, see
/// `fingerprint::node_id`).
pub type NodeId = String;

/// Dense integer identifying a vector inside the HNSW index. Assigned
/// monotonically by the metadata store and never reused.
pub type Label = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Rust,
    TypeScript,
    JavaScript,
    Python,
    Go,
    Java,
    Other(String),
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Language::Rust => "rust",
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Go => "go",
            Language::Java => "java",
            Language::Other(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

/// Canonical node kinds produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    File,
    Module,
    Class,
    Interface,
    Function,
    Method,
    Constructor,
    Enum,
    TypeAlias,
    Import,
    Variable,
    Property,
    Parameter,
    IfStatement,
    StringLiteral,
    Comment,
    Other,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Module => "module",
            NodeKind::Class => "class",
            NodeKind::Interface => "interface",
            NodeKind::Function => "function",
            NodeKind::Method => "method",
            NodeKind::Constructor => "constructor",
            NodeKind::Enum => "enum",
            NodeKind::TypeAlias => "type-alias",
            NodeKind::Import => "import",
            NodeKind::Variable => "variable",
            NodeKind::Property => "property",
            NodeKind::Parameter => "parameter",
            NodeKind::IfStatement => "if-statement",
            NodeKind::StringLiteral => "string-literal",
            NodeKind::Comment => "comment",
            NodeKind::Other => "other",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Five-level estimate of a node's importance to code intelligence queries.
/// Ordered: `Critical > High > Medium > Low > Minimal`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    Minimal = 1,
    Low = 2,
    Medium = 3,
    High = 4,
    Critical = 5,
}

impl Significance {
    pub fn from_level(level: i32) -> Self {
        match level {
            i32::MIN..=1 => Significance::Minimal,
            2 => Significance::Low,
            3 => Significance::Medium,
            4 => Significance::High,
            _ => Significance::Critical,
        }
    }

    pub fn level(&self) -> i32 {
        *self as i32
    }

    /// Apply a signed level offset, clamping into the `[min, max]` window.
    pub fn offset_clamped(&self, delta: i32, min: Significance, max: Significance) -> Self {
        let level = (self.level() + delta).clamp(min.level(), max.level());
        Significance::from_level(level)
    }
}

impl fmt::Display for Significance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Significance::Critical => "critical",
            Significance::High => "high",
            Significance::Medium => "medium",
            Significance::Low => "low",
            Significance::Minimal => "minimal",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Significance {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Significance::Critical),
            "high" => Ok(Significance::High),
            "medium" => Ok(Significance::Medium),
            "low" => Ok(Significance::Low),
            "minimal" => Ok(Significance::Minimal),
            other => Err(format!("unknown significance level: {}", other)),
        }
    }
}

/// Byte offsets are canonical; line and column are derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
    pub byte_offset: usize,
}

impl Position {
    pub fn new(line: u32, column: u32, byte_offset: usize) -> Self {
        Self {
            line,
            column,
            byte_offset,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportInfo {
    pub local_name: String,
    pub source: String,
    pub imported_name: Option<String>,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportInfo {
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub language: Option<Language>,
    pub scope: Vec<String>,
    pub modifiers: BTreeSet<String>,
    pub docstring: Option<String>,
    pub imports: BTreeSet<String>,
    pub exports: BTreeSet<String>,
    pub annotations: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub language_specific: BTreeMap<String, String>,
}

/// Per-vector metadata joined into search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub signature: String,
    pub summary: String,
    pub file_id: String,
    pub file_path: String,
    pub line: u32,
    pub confidence: f32,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

/// Field-by-field merge payload for `update_vector`; unspecified fields are
/// preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorMetadataPatch {
    pub signature: Option<String>,
    pub summary: Option<String>,
    pub file_id: Option<String>,
    pub file_path: Option<String>,
    pub line: Option<u32>,
    pub confidence: Option<f32>,
}

impl VectorMetadata {
    pub fn apply_patch(&mut self, patch: &VectorMetadataPatch) {
        if let Some(signature) = &patch.signature {
            self.signature = signature.clone();
        }
        if let Some(summary) = &patch.summary {
            self.summary = summary.clone();
        }
        if let Some(file_id) = &patch.file_id {
            self.file_id = file_id.clone();
        }
        if let Some(file_path) = &patch.file_path {
            self.file_path = file_path.clone();
        }
        if let Some(line) = patch.line {
            self.line = line;
        }
        if let Some(confidence) = patch.confidence {
            self.confidence = confidence;
        }
        self.last_updated = chrono::Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub node_id: NodeId,
    pub label: Label,
    pub embedding: Vec<f32>,
    pub metadata: VectorMetadata,
    pub inserted_at: chrono::DateTime<chrono::Utc>,
}

/// One result row from `search_similar`: ascending distance, ties broken by
/// ascending label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub node_id: NodeId,
    pub distance: f32,
    pub score: f32,
    pub metadata: VectorMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Initializing,
    Ready,
    Rebuilding,
    Error,
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexStatus::Initializing => "initializing",
            IndexStatus::Ready => "ready",
            IndexStatus::Rebuilding => "rebuilding",
            IndexStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one executed query, persisted to the L3 query log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogRecord {
    pub query_text: String,
    pub query_hash: String,
    pub options_json: String,
    pub result_count: usize,
    pub execution_ms: u64,
    pub cache_hit: bool,
    pub cache_level: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub index_version: u64,
}

/// Best-effort batch outcome: `success_count + failure_count == batch len`,
/// every failure names the responsible node.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub failure_count: usize,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug)]
pub struct BatchFailure {
    pub node_id: NodeId,
    pub error: crate::AstDbError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn significance_ordering() {
        assert!(Significance::Critical > Significance::High);
        assert!(Significance::High > Significance::Medium);
        assert!(Significance::Medium > Significance::Low);
        assert!(Significance::Low > Significance::Minimal);
    }

    #[test]
    fn significance_offset_clamps_at_bounds() {
        let min = Significance::Minimal;
        let max = Significance::Critical;
        assert_eq!(
            Significance::High.offset_clamped(3, min, max),
            Significance::Critical
        );
        assert_eq!(
            Significance::Low.offset_clamped(-4, min, max),
            Significance::Minimal
        );
        assert_eq!(
            Significance::Medium.offset_clamped(1, min, max),
            Significance::High
        );
    }

    #[test]
    fn metadata_patch_preserves_unspecified_fields() {
        let mut meta = VectorMetadata {
            signature: "fn a()".into(),
            summary: "does a".into(),
            file_id: "f1".into(),
            file_path: "src/a.rs".into(),
            line: 10,
            confidence: 0.9,
            last_updated: chrono::Utc::now(),
        };
        meta.apply_patch(&VectorMetadataPatch {
            summary: Some("does a better".into()),
            confidence: Some(0.95),
            ..Default::default()
        });
        assert_eq!(meta.signature, "fn a()");
        assert_eq!(meta.summary, "does a better");
        assert_eq!(meta.file_path, "src/a.rs");
        assert_eq!(meta.line, 10);
        assert!((meta.confidence - 0.95).abs() < f32::EPSILON);
    }
}
