use astdb_core::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Collect candidate source files under `dir`, honoring the configured
/// include and exclude globs. Results carry file sizes so the coordinator
/// can schedule big files first.
pub fn collect_source_files(
    dir: &Path,
    include_patterns: &[String],
    exclude_patterns: &[String],
) -> Result<Vec<(PathBuf, u64)>> {
    let include_set = if include_patterns.iter().all(|p| p == "**/*") {
        None
    } else {
        build_globset(include_patterns)
    };
    let exclude_set = build_globset(exclude_patterns);

    let walker = WalkBuilder::new(dir)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .ignore(true)
        .build();

    let mut files = Vec::new();
    for dent in walker {
        let dent = match dent {
            Ok(d) => d,
            Err(e) => {
                warn!("walker error: {}", e);
                continue;
            }
        };
        let path = dent.path();
        if !path.is_file() {
            continue;
        }
        if let Some(set) = &exclude_set {
            if set.is_match(path) {
                continue;
            }
        }
        if let Some(set) = &include_set {
            if !set.is_match(path) {
                continue;
            }
        }
        let size = dent.metadata().map(|m| m.len()).unwrap_or(0);
        files.push((path.to_path_buf(), size));
    }

    // Largest first to reduce tail latency under bounded concurrency.
    files.sort_by(|a, b| b.1.cmp(&a.1));
    debug!("collected {} candidate files under {}", files.len(), dir.display());
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    let mut any = false;
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
                any = true;
            }
            Err(e) => warn!("skipping invalid glob {}: {}", pattern, e),
        }
    }
    if !any {
        return None;
    }
    builder.build().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_matched_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn a() {}").unwrap();
        std::fs::write(dir.path().join("target/debug/gen.rs"), "fn b() {}").unwrap();

        let files = collect_source_files(
            dir.path(),
            &["**/*.rs".to_string()],
            &["**/target/**".to_string()],
        )
        .unwrap();

        assert_eq!(files.len(), 1);
        assert!(files[0].0.ends_with("src/lib.rs"));
    }

    #[test]
    fn invalid_globs_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        let files =
            collect_source_files(dir.path(), &["[bad".to_string(), "**/*.rs".to_string()], &[])
                .unwrap();
        assert_eq!(files.len(), 1);
    }
}
