use crate::{NodeId, NodeKind, NodeMetadata, Position, Significance};
use serde::{Deserialize, Serialize};

/// Persisted unit of work produced by the parse pipeline.
///
/// `id` is a pure function of stable inputs (see `fingerprint::node_id`):
/// re-parsing identical bytes of an unchanged file yields identical ids.
/// `parent_id`/`children_ids` form a forest rooted at file nodes; children
/// are stored by id only and resolved through the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: Option<String>,
    pub file_path: String,
    pub start: Position,
    pub end: Position,
    pub source_text: Option<String>,
    pub complexity: Option<u32>,
    pub metadata: NodeMetadata,
    pub significance: Significance,
    pub parent_id: Option<NodeId>,
    pub children_ids: Vec<NodeId>,
}

impl Node {
    pub fn new(
        id: NodeId,
        kind: NodeKind,
        file_path: impl Into<String>,
        start: Position,
        end: Position,
    ) -> Self {
        Self {
            id,
            kind,
            name: None,
            file_path: file_path.into(),
            start,
            end,
            source_text: None,
            complexity: None,
            metadata: NodeMetadata::default(),
            significance: Significance::Medium,
            parent_id: None,
            children_ids: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_source_text(mut self, text: impl Into<String>) -> Self {
        self.source_text = Some(text.into());
        self
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = Some(complexity);
        self
    }

    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_significance(mut self, significance: Significance) -> Self {
        self.significance = significance;
        self
    }

    pub fn byte_len(&self) -> usize {
        self.end.byte_offset.saturating_sub(self.start.byte_offset)
    }

    /// Display name: the extracted identifier, or a synthesized
    /// `kind@offset` for anonymous nodes.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}@{}", self.kind, self.start.byte_offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_synthesized_for_anonymous_nodes() {
        let node = Node::new(
            "abc".into(),
            NodeKind::IfStatement,
            "src/x.rs",
            Position::new(3, 0, 120),
            Position::new(5, 1, 200),
        );
        assert_eq!(node.display_name(), "if-statement@120");
        assert_eq!(node.byte_len(), 80);
    }
}
