//! Drives the per-file pipeline: fingerprint, parse, classify, extract,
//! score, and emit deltas against the prior parse of the same file.

use crate::classifier::{normalized_shape, Classifier};
use crate::complexity::cyclomatic_complexity;
use crate::extractor::MetadataExtractor;
use crate::file_collect::collect_source_files;
use crate::grammar::GrammarRuntime;
use crate::language::LanguageRegistry;
use crate::significance::{
    is_main_path, is_test_path, NodeFacts, SignificanceCalculator, SignificanceConfig,
};
use astdb_core::{
    fingerprint, AstDbError, EngineConfig, EngineEvent, EventBus, Language, Node, NodeId,
    NodeKind, Result,
};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_STORED_SOURCE_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
struct FileState {
    fingerprint: String,
    node_ids: HashSet<NodeId>,
}

#[derive(Debug, Default)]
pub struct ParseStatistics {
    pub total_files: usize,
    pub parsed_files: usize,
    pub skipped_files: usize,
    pub failed_files: usize,
    pub total_nodes: usize,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct FileParse {
    pub file_path: String,
    pub nodes: Vec<Node>,
    pub skipped: bool,
}

pub struct ParseCoordinator {
    runtime: Arc<GrammarRuntime>,
    registry: LanguageRegistry,
    significance: SignificanceConfig,
    events: Arc<EventBus>,
    config: EngineConfig,
    file_state: DashMap<String, FileState>,
}

impl ParseCoordinator {
    pub fn new(runtime: Arc<GrammarRuntime>, events: Arc<EventBus>, config: EngineConfig) -> Self {
        Self {
            runtime,
            registry: LanguageRegistry::new(),
            significance: SignificanceConfig::default(),
            events,
            config,
            file_state: DashMap::new(),
        }
    }

    pub fn with_significance_config(mut self, config: SignificanceConfig) -> Self {
        self.significance = config;
        self
    }

    /// Forget prior parses, forcing a full re-parse on the next batch. Used
    /// when a depended-on grammar changes.
    pub fn invalidate_all(&self) {
        self.file_state.clear();
    }

    /// Parse one file. Unchanged bytes short-circuit; hard parse failures
    /// emit a `ParseError` event and surface the error to the caller (the
    /// batch driver treats them as per-file, not fatal).
    pub async fn parse_file(&self, path: &Path) -> Result<FileParse> {
        let file_path = path.to_string_lossy().to_string();
        let language = self
            .registry
            .detect_language(&file_path)
            .ok_or_else(|| AstDbError::GrammarUnavailable(file_path.clone()))?;

        let bytes = tokio::fs::read(path).await?;
        let file_fingerprint = fingerprint::file_fingerprint(&bytes);

        if let Some(state) = self.file_state.get(&file_path) {
            if state.fingerprint == file_fingerprint {
                debug!("unchanged, skipping {}", file_path);
                return Ok(FileParse {
                    file_path,
                    nodes: Vec::new(),
                    skipped: true,
                });
            }
        }

        let source = String::from_utf8_lossy(&bytes).into_owned();
        let runtime = Arc::clone(&self.runtime);
        let calculator_config = self.significance.clone();
        let path_for_task = file_path.clone();
        let language_for_task = language.clone();
        let nodes = tokio::task::spawn_blocking(move || {
            build_nodes(
                &runtime,
                &path_for_task,
                &language_for_task,
                &source,
                &calculator_config,
            )
        })
        .await
        .map_err(|e| AstDbError::Parse(format!("parse task panicked: {}", e)))?;

        let nodes = match nodes {
            Ok(nodes) => nodes,
            Err(e) => {
                self.events.emit(EngineEvent::ParseError {
                    file: file_path.clone(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        self.emit_deltas(&file_path, &nodes, file_fingerprint);
        Ok(FileParse {
            file_path,
            nodes,
            skipped: false,
        })
    }

    /// A file was removed: every node from its last parse is gone.
    pub fn remove_file(&self, path: &Path) {
        let file_path = path.to_string_lossy().to_string();
        if let Some((_, state)) = self.file_state.remove(&file_path) {
            for node_id in state.node_ids {
                self.events.emit(EngineEvent::NodeRemoved { node_id });
            }
        }
    }

    /// Walk `root` and parse everything the globs admit, with bounded
    /// concurrency. Per-file failures are counted, not fatal;
    /// cancellation stops admission of new files.
    pub async fn parse_directory(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Node>, ParseStatistics)> {
        let started = Instant::now();
        let include = self.config.parse_glob.clone();
        let exclude = self.config.exclude_glob.clone();
        let root_buf = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || {
            collect_source_files(&root_buf, &include, &exclude)
        })
        .await
        .map_err(|e| AstDbError::Parse(format!("file collection panicked: {}", e)))??;

        let files: Vec<_> = files
            .into_iter()
            .filter(|(p, _)| {
                self.registry
                    .detect_language(&p.to_string_lossy())
                    .is_some()
            })
            .collect();
        let total_files = files.len();
        info!("parsing {} files under {}", total_files, root.display());

        let concurrency = self.config.effective_concurrency();
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let mut stats = ParseStatistics {
            total_files,
            ..Default::default()
        };
        let mut all_nodes = Vec::new();

        let mut results = stream::iter(files.into_iter().map(|(path, _)| {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return Err(AstDbError::Cancelled);
                }
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| AstDbError::Cancelled)?;
                self.parse_file(&path).await
            }
        }))
        .buffer_unordered(concurrency);

        while let Some(result) = results.next().await {
            match result {
                Ok(parse) if parse.skipped => stats.skipped_files += 1,
                Ok(parse) => {
                    stats.parsed_files += 1;
                    stats.total_nodes += parse.nodes.len();
                    all_nodes.extend(parse.nodes);
                }
                Err(AstDbError::Cancelled) => {
                    return Err(AstDbError::Cancelled);
                }
                Err(e) => {
                    stats.failed_files += 1;
                    warn!("parse failure: {}", e);
                }
            }
        }

        stats.duration = started.elapsed();
        info!(
            "parse batch done: {}/{} parsed, {} skipped, {} failed, {} nodes in {:.2}s",
            stats.parsed_files,
            stats.total_files,
            stats.skipped_files,
            stats.failed_files,
            stats.total_nodes,
            stats.duration.as_secs_f64()
        );
        Ok((all_nodes, stats))
    }

    fn emit_deltas(&self, file_path: &str, nodes: &[Node], file_fingerprint: String) {
        let current_ids: HashSet<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        let prior_ids = self
            .file_state
            .get(file_path)
            .map(|s| s.node_ids.clone())
            .unwrap_or_default();

        for node in nodes {
            if !prior_ids.contains(&node.id) {
                self.events.emit(EngineEvent::NodeUpserted {
                    node_id: node.id.clone(),
                    kind: node.kind,
                    significance: node.significance,
                });
            }
        }
        for stale in prior_ids.difference(&current_ids) {
            self.events.emit(EngineEvent::NodeRemoved {
                node_id: stale.clone(),
            });
        }

        self.file_state.insert(
            file_path.to_string(),
            FileState {
                fingerprint: file_fingerprint,
                node_ids: current_ids,
            },
        );
    }
}

/// The CPU-bound half of a file parse: everything between reading the
/// bytes and handing back persisted nodes.
fn build_nodes(
    runtime: &GrammarRuntime,
    file_path: &str,
    language: &Language,
    source: &str,
    calculator_config: &SignificanceConfig,
) -> Result<Vec<Node>> {
    let tree = runtime.parse(source.as_bytes(), language)?;
    let classifier = Classifier::new(language.clone());
    let classified = classifier.classify_tree(&tree, source, file_path);
    let extractor = MetadataExtractor::new(language.clone());
    let ctx = extractor.file_context(&tree, source);
    let calculator = SignificanceCalculator::new(calculator_config.clone());

    let is_test_file = is_test_path(file_path);
    let is_main_file = is_main_path(file_path);

    let mut ids: Vec<NodeId> = Vec::with_capacity(classified.len());
    let mut seen: HashSet<NodeId> = HashSet::with_capacity(classified.len());
    for entry in classified.iter() {
        let id = fingerprint::node_id(
            file_path,
            entry.kind.as_str(),
            &normalized_shape(entry.ts_node),
            entry.ts_node.start_byte(),
        );
        if !seen.insert(id.clone()) {
            return Err(AstDbError::DuplicateId(format!(
                "{} in {}",
                id, file_path
            )));
        }
        ids.push(id);
    }

    let mut nodes = Vec::with_capacity(classified.len());
    for (index, entry) in classified.iter().enumerate() {
        let metadata = extractor.extract(entry, source, &ctx);
        let facts = gather_facts(entry, is_test_file, is_main_file, source);
        let (significance, _explanation) =
            calculator.calculate(entry.kind, entry.name.as_deref(), &metadata, &facts);

        let mut node = Node::new(
            ids[index].clone(),
            entry.kind,
            file_path,
            entry.start(),
            entry.end(),
        )
        .with_metadata(metadata)
        .with_significance(significance);

        if let Some(name) = &entry.name {
            node = node.with_name(name.clone());
        }
        if matches!(
            entry.kind,
            NodeKind::Function | NodeKind::Method | NodeKind::Constructor
        ) {
            node = node.with_complexity(facts.cyclomatic_complexity);
        }
        if node.byte_len() <= MAX_STORED_SOURCE_BYTES {
            if let Ok(text) = entry.ts_node.utf8_text(source.as_bytes()) {
                node = node.with_source_text(text);
            }
        }

        node.parent_id = entry.parent.map(|p| ids[p].clone());
        node.children_ids = entry.children.iter().map(|&c| ids[c].clone()).collect();
        nodes.push(node);
    }

    Ok(nodes)
}

fn gather_facts(
    entry: &crate::classifier::Classified<'_>,
    is_test_file: bool,
    is_main_file: bool,
    source: &str,
) -> NodeFacts {
    let ts_node = entry.ts_node;
    let parameter_count = ts_node
        .child_by_field_name("parameters")
        .map(|p| p.named_child_count())
        .unwrap_or(0);
    let member_count = ts_node
        .child_by_field_name("body")
        .map(|b| b.named_child_count())
        .unwrap_or(0);
    let cyclomatic = if matches!(
        entry.kind,
        NodeKind::Function | NodeKind::Method | NodeKind::Constructor
    ) {
        cyclomatic_complexity(&ts_node, source)
    } else {
        0
    };
    NodeFacts {
        child_count: ts_node.named_child_count(),
        source_len: ts_node.end_byte().saturating_sub(ts_node.start_byte()),
        parameter_count,
        member_count,
        cyclomatic_complexity: cyclomatic,
        scope_depth: entry.scope.len().saturating_sub(1),
        is_test_file,
        is_main_file,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn coordinator() -> ParseCoordinator {
        ParseCoordinator::new(
            Arc::new(GrammarRuntime::native()),
            Arc::new(EventBus::new()),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn reparse_of_unchanged_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.rs");
        std::fs::write(&path, "pub fn run() {}\n").unwrap();

        let c = coordinator();
        let first = c.parse_file(&path).await.unwrap();
        assert!(!first.skipped);
        assert!(!first.nodes.is_empty());

        let second = c.parse_file(&path).await.unwrap();
        assert!(second.skipped);
    }

    #[tokio::test]
    async fn identical_bytes_yield_identical_ids_and_significance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        let source = "class Widget:\n    def render(self):\n        return 1\n";
        std::fs::write(&path, source).unwrap();

        let c1 = coordinator();
        let c2 = coordinator();
        let first = c1.parse_file(&path).await.unwrap();
        let second = c2.parse_file(&path).await.unwrap();

        let ids1: Vec<_> = first.nodes.iter().map(|n| (&n.id, n.significance)).collect();
        let ids2: Vec<_> = second.nodes.iter().map(|n| (&n.id, n.significance)).collect();
        assert_eq!(ids1, ids2);
    }

    #[tokio::test]
    async fn deltas_emitted_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.rs");
        std::fs::write(&path, "fn alpha() {}\n").unwrap();

        let events = Arc::new(EventBus::new());
        let rx = events.subscribe();
        let c = ParseCoordinator::new(
            Arc::new(GrammarRuntime::native()),
            Arc::clone(&events),
            EngineConfig::default(),
        );

        c.parse_file(&path).await.unwrap();
        let initial_upserts = rx.try_iter().count();
        assert!(initial_upserts > 0);

        std::fs::write(&path, "fn beta() {}\n").unwrap();
        c.parse_file(&path).await.unwrap();
        let mut saw_removed = false;
        let mut saw_upserted = false;
        for event in rx.try_iter() {
            match event {
                EngineEvent::NodeRemoved { .. } => saw_removed = true,
                EngineEvent::NodeUpserted { .. } => saw_upserted = true,
                _ => {}
            }
        }
        assert!(saw_removed && saw_upserted);
    }

    #[tokio::test]
    async fn removed_file_emits_node_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.rs");
        std::fs::write(&path, "fn f() {}\n").unwrap();

        let events = Arc::new(EventBus::new());
        let c = ParseCoordinator::new(
            Arc::new(GrammarRuntime::native()),
            Arc::clone(&events),
            EngineConfig::default(),
        );
        c.parse_file(&path).await.unwrap();
        let rx = events.subscribe();
        c.remove_file(&path);
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, EngineEvent::NodeRemoved { .. })));
    }

    #[tokio::test]
    async fn directory_parse_counts_failures_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.rs"), "fn ok() {}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not source").unwrap();

        let c = coordinator();
        let cancel = CancellationToken::new();
        let (nodes, stats) = c.parse_directory(dir.path(), &cancel).await.unwrap();
        assert_eq!(stats.parsed_files, 1);
        assert!(nodes.iter().any(|n| n.name.as_deref() == Some("ok")));
    }

    #[tokio::test]
    async fn cancelled_batch_surfaces_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();

        let c = coordinator();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = c.parse_directory(dir.path(), &cancel).await;
        assert!(matches!(result, Err(AstDbError::Cancelled)));
    }

    #[tokio::test]
    async fn parent_child_ids_form_a_forest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.py");
        std::fs::write(&path, "class A:\n    def m(self):\n        pass\n").unwrap();

        let c = coordinator();
        let parse = c.parse_file(&path).await.unwrap();
        let by_id: HashMap<_, _> = parse.nodes.iter().map(|n| (n.id.clone(), n)).collect();

        let file_node = &parse.nodes[0];
        assert_eq!(file_node.kind, NodeKind::File);
        assert!(file_node.parent_id.is_none());

        for node in &parse.nodes[1..] {
            let parent = node.parent_id.as_ref().expect("non-root has parent");
            let parent_node = by_id.get(parent).expect("parent exists");
            assert!(parent_node.children_ids.contains(&node.id));
        }
    }
}
