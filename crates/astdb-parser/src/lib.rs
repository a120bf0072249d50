pub mod classifier;
pub mod complexity;
pub mod coordinator;
pub mod extractor;
pub mod file_collect;
pub mod grammar;
pub mod language;
pub mod significance;
pub mod watcher;

pub use classifier::{normalized_shape, Classified, Classifier};
pub use complexity::cyclomatic_complexity;
pub use coordinator::{FileParse, ParseCoordinator, ParseStatistics};
pub use extractor::{FileContext, MetadataExtractor};
pub use file_collect::collect_source_files;
pub use grammar::{
    BackendKind, GrammarBackend, GrammarManager, GrammarRuntime, NativeGrammarBackend,
    PortableGrammarBackend,
};
pub use language::{LanguageConfig, LanguageRegistry};
pub use significance::{
    NodeFacts, SignificanceCalculator, SignificanceConfig, SignificanceExplanation,
};
pub use watcher::{FileChange, FileWatcher};
