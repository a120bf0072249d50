//! Grammar runtime: pluggable parse backends plus digest verification for
//! on-disk grammar blobs.
//!
//! Backend selection order is native, then portable, then
//! `GrammarUnavailable`. The native backend wraps the statically linked
//! tree-sitter grammars; the portable backend loads verified grammar blobs
//! and only exists when the `wasm-grammars` feature is compiled in.

use crate::LanguageRegistry;
use astdb_core::{fingerprint, AstDbError, Language, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tree_sitter::{Parser, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Native,
    Portable,
}

pub trait GrammarBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Vec<Language>;

    fn parse(&self, source: &[u8], language: &Language) -> Result<Tree>;

    /// Pre-instantiate parsers so the first real parse does not pay setup
    /// cost.
    fn warmup(&self) -> Result<()> {
        Ok(())
    }
}

/// Statically linked tree-sitter grammars with a small parser pool per
/// language. Parsers are checked out for the duration of a parse and
/// returned afterwards.
pub struct NativeGrammarBackend {
    registry: LanguageRegistry,
    pool: Mutex<HashMap<Language, Vec<Parser>>>,
}

impl NativeGrammarBackend {
    pub fn new() -> Self {
        Self {
            registry: LanguageRegistry::new(),
            pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    fn checkout(&self, language: &Language) -> Result<Parser> {
        if let Some(parser) = self
            .pool
            .lock()
            .get_mut(language)
            .and_then(|parsers| parsers.pop())
        {
            return Ok(parser);
        }
        self.registry.create_parser(language).ok_or_else(|| {
            AstDbError::GrammarUnavailable(format!("no native grammar for {}", language))
        })
    }

    fn checkin(&self, language: &Language, parser: Parser) {
        self.pool.lock().entry(language.clone()).or_default().push(parser);
    }
}

impl Default for NativeGrammarBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GrammarBackend for NativeGrammarBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn capabilities(&self) -> Vec<Language> {
        self.registry.languages()
    }

    fn parse(&self, source: &[u8], language: &Language) -> Result<Tree> {
        let mut parser = self.checkout(language)?;
        let tree = parser.parse(source, None);
        self.checkin(language, parser);
        tree.ok_or_else(|| {
            AstDbError::Parse(format!("tree-sitter returned no tree for {}", language))
        })
    }

    fn warmup(&self) -> Result<()> {
        for language in self.registry.languages() {
            if let Some(parser) = self.registry.create_parser(&language) {
                self.checkin(&language, parser);
            }
        }
        Ok(())
    }
}

/// Manifest entry recorded when a grammar blob is installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrammarRecord {
    pub name: String,
    pub file: String,
    pub sha256: String,
}

/// Verifies content-addressed grammar blobs under `.astdb/grammars/`
/// against the digests recorded at install time. A blob whose digest does
/// not match is never loaded.
pub struct GrammarManager {
    grammars_dir: PathBuf,
    records: HashMap<String, GrammarRecord>,
}

impl GrammarManager {
    const MANIFEST: &'static str = "grammars.json";

    pub fn open(grammars_dir: impl Into<PathBuf>) -> Result<Self> {
        let grammars_dir = grammars_dir.into();
        let manifest_path = grammars_dir.join(Self::MANIFEST);
        let records = if manifest_path.exists() {
            let data = std::fs::read_to_string(&manifest_path)?;
            let list: Vec<GrammarRecord> = serde_json::from_str(&data)?;
            list.into_iter().map(|r| (r.name.clone(), r)).collect()
        } else {
            HashMap::new()
        };
        debug!(
            "grammar manifest loaded: {} entries from {}",
            records.len(),
            grammars_dir.display()
        );
        Ok(Self {
            grammars_dir,
            records,
        })
    }

    pub fn record(&self, name: &str) -> Option<&GrammarRecord> {
        self.records.get(name)
    }

    /// Register a blob already present in the grammars directory, recording
    /// its current digest.
    pub fn install(&mut self, name: &str, file: &str) -> Result<()> {
        let blob = std::fs::read(self.grammars_dir.join(file))?;
        let digest = fingerprint::grammar_digest(&blob);
        self.records.insert(
            name.to_string(),
            GrammarRecord {
                name: name.to_string(),
                file: file.to_string(),
                sha256: digest,
            },
        );
        self.persist()
    }

    /// Read a blob and verify it against the recorded digest.
    pub fn verified_blob(&self, name: &str) -> Result<Vec<u8>> {
        let record = self.records.get(name).ok_or_else(|| {
            AstDbError::GrammarUnavailable(format!("grammar {} is not installed", name))
        })?;
        let path = self.grammars_dir.join(&record.file);
        let blob = std::fs::read(&path)
            .map_err(|_| AstDbError::GrammarUnavailable(format!("missing blob for {}", name)))?;
        let digest = fingerprint::grammar_digest(&blob);
        if digest != record.sha256 {
            return Err(AstDbError::GrammarDigestMismatch {
                grammar: name.to_string(),
                expected: record.sha256.clone(),
                actual: digest,
            });
        }
        Ok(blob)
    }

    fn persist(&self) -> Result<()> {
        std::fs::create_dir_all(&self.grammars_dir)?;
        let list: Vec<&GrammarRecord> = self.records.values().collect();
        let data = serde_json::to_string_pretty(&list)?;
        std::fs::write(self.grammars_dir.join(Self::MANIFEST), data)?;
        Ok(())
    }
}

/// Portable backend placeholder: grammar blobs are verified through the
/// manager, but bytecode execution is only compiled in with the
/// `wasm-grammars` feature.
pub struct PortableGrammarBackend {
    manager: GrammarManager,
}

impl PortableGrammarBackend {
    pub fn new(manager: GrammarManager) -> Self {
        Self { manager }
    }
}

impl GrammarBackend for PortableGrammarBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Portable
    }

    #[cfg(feature = "wasm-grammars")]
    fn capabilities(&self) -> Vec<Language> {
        // Verified blobs define the portable capability set.
        self.manager
            .records
            .keys()
            .map(|name| Language::Other(name.clone()))
            .collect()
    }

    #[cfg(not(feature = "wasm-grammars"))]
    fn capabilities(&self) -> Vec<Language> {
        Vec::new()
    }

    fn parse(&self, _source: &[u8], language: &Language) -> Result<Tree> {
        // Verification still runs so a corrupt blob is reported as such
        // rather than as a missing grammar.
        let name = language.to_string();
        let _blob = self.manager.verified_blob(&name)?;
        Err(AstDbError::GrammarUnavailable(format!(
            "portable grammar execution is not compiled in (language {})",
            language
        )))
    }
}

/// Front door for parsing: tries each backend in selection order for the
/// requested language.
pub struct GrammarRuntime {
    backends: Vec<Box<dyn GrammarBackend>>,
}

impl GrammarRuntime {
    pub fn new(backends: Vec<Box<dyn GrammarBackend>>) -> Self {
        Self { backends }
    }

    /// Native backend only; the configuration most deployments run.
    pub fn native() -> Self {
        Self::new(vec![Box::new(NativeGrammarBackend::new())])
    }

    pub fn with_portable(grammars_dir: &Path) -> Result<Self> {
        let manager = GrammarManager::open(grammars_dir)?;
        Ok(Self::new(vec![
            Box::new(NativeGrammarBackend::new()),
            Box::new(PortableGrammarBackend::new(manager)),
        ]))
    }

    pub fn capabilities(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self
            .backends
            .iter()
            .flat_map(|b| b.capabilities())
            .collect();
        languages.dedup();
        languages
    }

    pub fn warmup(&self) -> Result<()> {
        for backend in &self.backends {
            backend.warmup()?;
        }
        info!("grammar runtime warmed: {} backends", self.backends.len());
        Ok(())
    }

    pub fn parse(&self, source: &[u8], language: &Language) -> Result<Tree> {
        for backend in &self.backends {
            if backend.capabilities().contains(language) {
                return backend.parse(source, language);
            }
            warn!(
                "backend {:?} cannot parse {}, trying next",
                backend.kind(),
                language
            );
        }
        Err(AstDbError::GrammarUnavailable(format!(
            "no backend can parse {}",
            language
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_backend_parses_rust() {
        let backend = NativeGrammarBackend::new();
        backend.warmup().unwrap();
        let tree = backend
            .parse(b"fn main() {}", &Language::Rust)
            .unwrap();
        assert_eq!(tree.root_node().kind(), "source_file");
    }

    #[test]
    fn runtime_reports_unavailable_language() {
        let runtime = GrammarRuntime::native();
        let result = runtime.parse(b"puts 'hi'", &Language::Other("ruby".into()));
        assert!(matches!(result, Err(AstDbError::GrammarUnavailable(_))));
    }

    #[test]
    fn manager_detects_tampered_blob() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("toy.wasm"), b"grammar-bytes").unwrap();

        let mut manager = GrammarManager::open(dir.path()).unwrap();
        manager.install("toy", "toy.wasm").unwrap();
        assert!(manager.verified_blob("toy").is_ok());

        std::fs::write(dir.path().join("toy.wasm"), b"tampered").unwrap();
        let reloaded = GrammarManager::open(dir.path()).unwrap();
        assert!(matches!(
            reloaded.verified_blob("toy"),
            Err(AstDbError::GrammarDigestMismatch { .. })
        ));
    }

    #[test]
    fn manager_reports_missing_grammar() {
        let dir = tempfile::tempdir().unwrap();
        let manager = GrammarManager::open(dir.path()).unwrap();
        assert!(matches!(
            manager.verified_blob("nope"),
            Err(AstDbError::GrammarUnavailable(_))
        ));
    }
}
