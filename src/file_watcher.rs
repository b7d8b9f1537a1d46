//! File change notifications.
//!
//! [`FileWatcher`] reports edits to a fixed set of files using OS-native
//! mechanisms (inotify on Linux, FSEvents/kqueue on macOS) via the `notify`
//! crate. Each file is watched through its parent directory, so writers that
//! replace a file with temp-file + rename (the script store does) are seen
//! the same way as in-place edits.
//!
//! Consumption is by polling: [`FileWatcher::poll`] drains buffered events
//! and returns the watched files they touched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Non-blocking watcher over individual files.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
    dirs: HashSet<PathBuf>,
    files: HashSet<PathBuf>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl FileWatcher {
    /// Create a watcher with no watched files.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS file watcher cannot be initialized
    /// (e.g., inotify instance limits).
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("Failed to create file watcher")?;

        Ok(Self {
            watcher,
            rx,
            dirs: HashSet::new(),
            files: HashSet::new(),
        })
    }

    /// Start reporting changes to `path`.
    ///
    /// The file itself may not exist yet, but its directory must. Returns
    /// the key [`poll`](Self::poll) will report for this file.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory is missing or the watch
    /// can't be registered.
    pub fn watch_file(&mut self, path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .with_context(|| format!("Not a file path: {}", path.display()))?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let dir = parent
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", parent.display()))?;

        if !self.dirs.contains(&dir) {
            self.watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch: {}", dir.display()))?;
            self.dirs.insert(dir.clone());
        }

        let key = dir.join(name);
        log::info!("Watching for file changes: {}", key.display());
        self.files.insert(key.clone());
        Ok(key)
    }

    /// Drain buffered events (non-blocking).
    ///
    /// Returns each watched file that was created, modified, renamed or
    /// removed since the last call, once. Watcher errors are logged and
    /// skipped.
    #[must_use]
    pub fn poll(&self) -> HashSet<PathBuf> {
        let mut changed = HashSet::new();
        while let Ok(result) = self.rx.try_recv() {
            match result {
                Ok(event) => {
                    if !is_mutation(&event.kind) {
                        continue;
                    }
                    changed.extend(event.paths.into_iter().filter(|p| self.files.contains(p)));
                }
                Err(e) => log::warn!("File watcher error: {e}"),
            }
        }
        changed
    }
}

/// Whether `kind` can change a file's contents.
fn is_mutation(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn wait_for(watcher: &FileWatcher, key: &Path) -> HashSet<PathBuf> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = HashSet::new();
        while Instant::now() < deadline {
            seen.extend(watcher.poll());
            if seen.contains(key) {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        seen
    }

    #[test]
    fn test_reports_only_watched_files() {
        let dir = TempDir::new().expect("tempdir");
        let watched = dir.path().join("scripts.json");
        std::fs::write(&watched, "{}").expect("write");

        let mut watcher = FileWatcher::new().expect("Should create watcher");
        let key = watcher.watch_file(&watched).expect("watch");
        assert!(watcher.poll().is_empty());

        std::fs::write(dir.path().join("other.json"), "{}").expect("write other");
        std::fs::write(&watched, "{\"version\":1}").expect("rewrite");

        let seen = wait_for(&watcher, &key);
        assert_eq!(seen, HashSet::from([key]));
    }

    #[test]
    fn test_rename_over_watched_file_is_reported() {
        let dir = TempDir::new().expect("tempdir");
        let watched = dir.path().join("snapshot.json");

        let mut watcher = FileWatcher::new().expect("Should create watcher");
        let key = watcher.watch_file(&watched).expect("watch missing file");

        let tmp = dir.path().join("snapshot.json.tmp");
        std::fs::write(&tmp, "{}").expect("write tmp");
        std::fs::rename(&tmp, &watched).expect("rename");

        assert!(wait_for(&watcher, &key).contains(&key));
    }

    #[test]
    fn test_missing_directory_fails() {
        let mut watcher = FileWatcher::new().expect("Should create watcher");
        let result = watcher.watch_file(Path::new("/nonexistent/dir/abc123/file.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_is_mutation() {
        use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind, RenameMode};
        assert!(is_mutation(&EventKind::Create(CreateKind::File)));
        assert!(is_mutation(&EventKind::Modify(ModifyKind::Name(RenameMode::To))));
        assert!(is_mutation(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_mutation(&EventKind::Access(AccessKind::Read)));
    }
}
