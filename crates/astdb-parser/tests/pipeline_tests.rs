use astdb_core::{EngineConfig, EventBus, NodeKind, Significance};
use astdb_parser::{GrammarRuntime, ParseCoordinator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn coordinator() -> ParseCoordinator {
    ParseCoordinator::new(
        Arc::new(GrammarRuntime::native()),
        Arc::new(EventBus::new()),
        EngineConfig::default(),
    )
}

#[tokio::test]
async fn python_private_method_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("service.py");
    std::fs::write(
        &path,
        "class Service:\n    def _helper(self):\n        \"\"\"Internal step.\"\"\"\n        return 1\n",
    )
    .unwrap();

    let parse = coordinator().parse_file(&path).await.unwrap();
    let method = parse
        .nodes
        .iter()
        .find(|n| n.kind == NodeKind::Method)
        .expect("method node");

    assert_eq!(method.name.as_deref(), Some("_helper"));
    assert!(method.metadata.modifiers.contains("private"));
    assert_eq!(
        method.metadata.scope,
        vec![
            "service".to_string(),
            "Service".to_string(),
            "_helper".to_string()
        ]
    );
    assert_eq!(method.metadata.docstring.as_deref(), Some("Internal step."));
}

#[tokio::test]
async fn significance_spread_across_kinds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lib.rs");
    std::fs::write(
        &path,
        "pub struct Engine { field: u32 }\n\npub fn start() { let x = 1; if x > 0 {} }\n",
    )
    .unwrap();

    let parse = coordinator().parse_file(&path).await.unwrap();

    let file = parse.nodes.iter().find(|n| n.kind == NodeKind::File).unwrap();
    let class = parse.nodes.iter().find(|n| n.kind == NodeKind::Class).unwrap();
    let function = parse
        .nodes
        .iter()
        .find(|n| n.kind == NodeKind::Function)
        .unwrap();
    let branch = parse
        .nodes
        .iter()
        .find(|n| n.kind == NodeKind::IfStatement)
        .unwrap();

    assert!(file.significance >= Significance::High);
    assert!(class.significance >= function.significance);
    assert!(function.significance > branch.significance);
}

#[tokio::test]
async fn mixed_language_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.rs"), "pub fn alpha() {}\n").unwrap();
    std::fs::write(dir.path().join("b.py"), "def beta():\n    pass\n").unwrap();
    std::fs::write(
        dir.path().join("c.ts"),
        "export function gamma(): number { return 1; }\n",
    )
    .unwrap();

    let (nodes, stats) = coordinator()
        .parse_directory(dir.path(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.parsed_files, 3);

    let names: Vec<&str> = nodes.iter().filter_map(|n| n.name.as_deref()).collect();
    assert!(names.contains(&"alpha"));
    assert!(names.contains(&"beta"));
    assert!(names.contains(&"gamma"));
}

#[tokio::test]
async fn node_ids_stable_across_unrelated_edits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.py");
    std::fs::write(&path, "def first():\n    pass\n\ndef second():\n    pass\n").unwrap();

    let c = coordinator();
    let before = c.parse_file(&path).await.unwrap();
    let first_id_before = before
        .nodes
        .iter()
        .find(|n| n.name.as_deref() == Some("first"))
        .unwrap()
        .id
        .clone();

    // Appending below `first` leaves its bytes and offset untouched.
    std::fs::write(
        &path,
        "def first():\n    pass\n\ndef second():\n    pass\n\ndef third():\n    pass\n",
    )
    .unwrap();
    let after = c.parse_file(&path).await.unwrap();
    let first_id_after = after
        .nodes
        .iter()
        .find(|n| n.name.as_deref() == Some("first"))
        .unwrap()
        .id
        .clone();

    assert_eq!(first_id_before, first_id_after);
}
