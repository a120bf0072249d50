//! File watcher feeding the parse coordinator: raw notify events are
//! coalesced over a debounce window and filtered by the watch globs before
//! they become reparse work.

use astdb_core::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Modified(PathBuf),
    Removed(PathBuf),
}

pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    changes: Receiver<Vec<FileChange>>,
}

impl FileWatcher {
    /// Watch `root` recursively. Events are debounced for `debounce` and
    /// delivered as de-duplicated batches.
    pub fn start(root: &Path, watch_glob: &[String], debounce: Duration) -> Result<Self> {
        let glob_set = build_globset(watch_glob);
        let (raw_tx, raw_rx) = unbounded::<FileChange>();
        let (batch_tx, batch_rx) = unbounded::<Vec<FileChange>>();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for change in translate(&event) {
                        if matches(&glob_set, change.path()) {
                            let _ = raw_tx.send(change);
                        }
                    }
                }
                Err(e) => warn!("watch error: {}", e),
            }
        })
        .map_err(|e| astdb_core::AstDbError::InvalidPath(e.to_string()))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| astdb_core::AstDbError::InvalidPath(e.to_string()))?;

        std::thread::spawn(move || debounce_loop(raw_rx, batch_tx, debounce));

        Ok(Self {
            _watcher: watcher,
            changes: batch_rx,
        })
    }

    pub fn changes(&self) -> &Receiver<Vec<FileChange>> {
        &self.changes
    }
}

impl FileChange {
    pub fn path(&self) -> &Path {
        match self {
            FileChange::Modified(p) | FileChange::Removed(p) => p,
        }
    }
}

fn translate(event: &Event) -> Vec<FileChange> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| FileChange::Modified(p.clone()))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| FileChange::Removed(p.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

fn matches(glob_set: &Option<GlobSet>, path: &Path) -> bool {
    match glob_set {
        Some(set) => set.is_match(path),
        None => true,
    }
}

/// Collect raw changes until the window goes quiet, then flush one batch.
/// A removal supersedes earlier modifications of the same path.
fn debounce_loop(
    raw: Receiver<FileChange>,
    batches: Sender<Vec<FileChange>>,
    window: Duration,
) {
    loop {
        let first = match raw.recv() {
            Ok(change) => change,
            Err(_) => return,
        };
        let mut modified: BTreeSet<PathBuf> = BTreeSet::new();
        let mut removed: BTreeSet<PathBuf> = BTreeSet::new();
        absorb(first, &mut modified, &mut removed);

        while let Ok(change) = raw.recv_timeout(window) {
            absorb(change, &mut modified, &mut removed);
        }

        let mut batch: Vec<FileChange> = Vec::with_capacity(modified.len() + removed.len());
        batch.extend(modified.into_iter().map(FileChange::Modified));
        batch.extend(removed.into_iter().map(FileChange::Removed));
        debug!("debounced watch batch: {} changes", batch.len());
        if batches.send(batch).is_err() {
            return;
        }
    }
}

fn absorb(change: FileChange, modified: &mut BTreeSet<PathBuf>, removed: &mut BTreeSet<PathBuf>) {
    match change {
        FileChange::Modified(p) => {
            if !removed.contains(&p) {
                modified.insert(p);
            }
        }
        FileChange::Removed(p) => {
            modified.remove(&p);
            removed.insert(p);
        }
    }
}

fn build_globset(patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!("invalid watch glob {}: {}", pattern, e),
        }
    }
    builder.build().ok()
}
