//! Filesystem watcher for changes made outside the editor

use anyhow::Result;
use notify::event::ModifyKind;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Events emitted by the file watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// File or directory created
    Created(PathBuf),
    /// File or directory modified
    Modified(PathBuf),
    /// File or directory removed (or renamed away)
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(path) | WatchEvent::Modified(path) | WatchEvent::Removed(path) => path,
        }
    }
}

/// Watches the workspace and forwards relevant changes over a channel.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    event_rx: mpsc::UnboundedReceiver<WatchEvent>,
    watched_paths: HashSet<PathBuf>,
    root_path: PathBuf,
}

impl FileWatcher {
    /// Create a watcher for `root_path`. Paths inside directories whose
    /// names start with one of `exclude_prefixes` are never reported.
    pub fn new(root_path: impl AsRef<Path>, exclude_prefixes: Vec<String>) -> Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let root = root_path.clone();
        let watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                debug!("File system event: {:?}", event);
                Self::handle_notify_event(event, &root, &exclude_prefixes, &event_tx);
            }
            Err(e) => {
                error!("File system watch error: {}", e);
            }
        })?;

        Ok(Self { watcher, event_rx, watched_paths: HashSet::new(), root_path })
    }

    fn handle_notify_event(
        event: notify::Event,
        root: &Path,
        exclude_prefixes: &[String],
        event_tx: &mpsc::UnboundedSender<WatchEvent>,
    ) {
        for path in event.paths {
            if should_ignore_path(root, &path, exclude_prefixes) {
                continue;
            }
            let watch_event = match event.kind {
                notify::EventKind::Create(_) => WatchEvent::Created(path),
                // A rename reports both ends; whichever no longer exists is gone.
                notify::EventKind::Modify(ModifyKind::Name(_)) if !path.exists() => WatchEvent::Removed(path),
                notify::EventKind::Modify(ModifyKind::Metadata(_)) => continue,
                notify::EventKind::Modify(_) => WatchEvent::Modified(path),
                notify::EventKind::Remove(_) => WatchEvent::Removed(path),
                _ => continue,
            };
            if let Err(e) = event_tx.send(watch_event) {
                warn!("Failed to forward watch event: {}", e);
            }
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Watch a directory recursively
    pub fn watch_directory(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!("Watching directory: {:?}", path);

        self.watcher.watch(path, RecursiveMode::Recursive)?;
        self.watched_paths.insert(path.to_path_buf());
        Ok(())
    }

    /// Stop watching a path
    pub fn unwatch(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!("Stopping watch for: {:?}", path);

        self.watcher.unwatch(path)?;
        self.watched_paths.remove(path);
        Ok(())
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched_paths.contains(path)
    }

    /// Wait for the next event. `None` once the watcher is gone.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.event_rx.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<WatchEvent> {
        self.event_rx.try_recv().ok()
    }
}

/// Check if a path lies in a directory we never index (VCS metadata, build
/// tool output trees).
pub fn should_ignore_path(root: &Path, path: &Path, exclude_prefixes: &[String]) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| {
        component.as_os_str().to_str().is_some_and(|name| {
            name == ".git" || exclude_prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::{Duration, timeout};

    fn prefixes() -> Vec<String> {
        vec!["bazel-".to_string(), ".bazel".to_string()]
    }

    #[tokio::test]
    async fn test_file_watcher_creation() {
        let temp_dir = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(temp_dir.path(), prefixes()).unwrap();
        watcher.watch_directory(temp_dir.path()).unwrap();
        assert!(watcher.is_watching(temp_dir.path()));
    }

    #[tokio::test]
    async fn test_watch_events() {
        let temp_dir = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(temp_dir.path(), prefixes()).unwrap();
        watcher.watch_directory(temp_dir.path()).unwrap();

        let build_file = temp_dir.path().join("BUILD");
        std::fs::write(&build_file, "go_library(name = \"a\")").unwrap();

        // Delivery timing is platform dependent; only check what arrives.
        if let Ok(Some(event)) = timeout(Duration::from_secs(2), watcher.next_event()).await {
            assert!(event.path().ends_with("BUILD"));
        }
    }

    #[test]
    fn test_should_ignore_path() {
        let root = Path::new("/ws");
        assert!(should_ignore_path(root, Path::new("/ws/bazel-out/k8/BUILD"), &prefixes()));
        assert!(should_ignore_path(root, Path::new("/ws/.git/index"), &prefixes()));
        assert!(should_ignore_path(root, Path::new("/ws/.bazelrc.d/x"), &prefixes()));
        assert!(!should_ignore_path(root, Path::new("/ws/app/BUILD"), &prefixes()));
    }
}
