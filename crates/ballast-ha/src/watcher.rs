//! Engine-liveness watcher
//!
//! Watches the engine's IPC socket inode. When the engine process dies
//! its socket is removed and the controller abdicates immediately,
//! cutting failover latency from a full master-down interval to one
//! filesystem-notification cycle.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;

use crate::Result;

pub struct EngineWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<()>,
}

impl EngineWatcher {
    /// Watch `socket_path` for removal. The parent directory is watched
    /// non-recursively; only removal of the socket itself signals.
    pub fn watch(socket_path: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let target = socket_path.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            if let Ok(event) = result {
                if matches!(event.kind, EventKind::Remove(_))
                    && event.paths.iter().any(|path| path == &target)
                {
                    let _ = tx.send(());
                }
            }
        })?;
        let dir = socket_path.parent().unwrap_or_else(|| Path::new("/"));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Resolves when the watched socket disappears.
    pub async fn removed(&mut self) {
        let _ = self.rx.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_detects_socket_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        std::fs::write(&path, b"").unwrap();

        let mut watcher = EngineWatcher::watch(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        tokio::time::timeout(Duration::from_secs(5), watcher.removed())
            .await
            .expect("removal not detected");
    }

    #[tokio::test]
    async fn test_ignores_sibling_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        let other = dir.path().join("other");
        std::fs::write(&path, b"").unwrap();
        std::fs::write(&other, b"").unwrap();

        let mut watcher = EngineWatcher::watch(&path).unwrap();
        std::fs::remove_file(&other).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), watcher.removed()).await;
        assert!(result.is_err());
    }
}
