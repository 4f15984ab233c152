//! Scoped cleanup of temporary paths and arbitrary handlers.
//!
//! Register what must go away before starting risky work. Cleanup runs on
//! [`ScopedCleanup::run`] or on drop, whichever comes first, so a failed
//! `?`, a panic unwinding through the scope, or a cancelled future all
//! still remove the registered artifacts.

use std::path::{Path, PathBuf};

type Handler = Box<dyn FnOnce() -> std::io::Result<()> + Send>;

#[derive(Default)]
pub struct ScopedCleanup {
    paths: Vec<PathBuf>,
    handlers: Vec<(String, Handler)>,
}

impl ScopedCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_path(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    pub fn register_handler<F>(&mut self, label: impl Into<String>, handler: F)
    where
        F: FnOnce() -> std::io::Result<()> + Send + 'static,
    {
        self.handlers.push((label.into(), Box::new(handler)));
    }

    /// Stop tracking `path`, e.g. once it has been promoted to its final
    /// location.
    pub fn disarm_path(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }

    pub fn pending(&self) -> usize {
        self.paths.len() + self.handlers.len()
    }

    /// Remove every registered path and invoke every handler once.
    ///
    /// Returns how many actions failed. Failures are logged, never raised.
    pub fn run(&mut self) -> usize {
        let mut failed = 0;

        for path in self.paths.drain(..) {
            if let Err(e) = remove_path(&path) {
                failed += 1;
                tracing::warn!(path = %path.display(), error = %e, "cleanup: failed to remove path");
            } else {
                tracing::debug!(path = %path.display(), "cleanup: removed path");
            }
        }

        for (label, handler) in self.handlers.drain(..) {
            if let Err(e) = handler() {
                failed += 1;
                tracing::warn!(handler = %label, error = %e, "cleanup: handler failed");
            }
        }

        failed
    }
}

impl Drop for ScopedCleanup {
    fn drop(&mut self) {
        if self.pending() > 0 {
            self.run();
        }
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_drop_removes_paths_and_runs_handlers_once() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("build");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("nested/file.json"), "{}").unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        {
            let mut scope = ScopedCleanup::new();
            scope.register_path(&dir);
            let c = calls.clone();
            scope.register_handler("count", move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert!(!dir.exists());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handler_does_not_stop_the_rest() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();

        let mut scope = ScopedCleanup::new();
        scope.register_handler("broken", || Err(std::io::Error::other("nope")));
        scope.register_path(&file);
        scope.register_path(tmp.path().join("never-existed"));

        assert_eq!(scope.run(), 1);
        assert!(!file.exists());
        assert_eq!(scope.pending(), 0);
    }

    #[test]
    fn test_disarmed_path_survives() {
        let tmp = TempDir::new().unwrap();
        let keep = tmp.path().join("keep");
        std::fs::create_dir_all(&keep).unwrap();

        let mut scope = ScopedCleanup::new();
        scope.register_path(&keep);
        scope.disarm_path(&keep);
        drop(scope);

        assert!(keep.exists());
    }

    #[tokio::test]
    async fn test_cleanup_runs_when_future_is_cancelled() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("work");
        std::fs::create_dir_all(&dir).unwrap();
        let d = dir.clone();
        let (armed_tx, armed_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(async move {
            let mut scope = ScopedCleanup::new();
            scope.register_path(d);
            let _ = armed_tx.send(());
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            scope.run();
        });
        armed_rx.await.unwrap();
        task.abort();
        let _ = task.await;

        assert!(!dir.exists());
    }
}
