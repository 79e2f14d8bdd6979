//! Advisory cross-process file locks with bounded waits.
//!
//! Each acquisition opens its own handle to the lock file, so the lock also
//! serializes threads of the same process. The lock is released when the
//! guard is dropped.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, trace, warn};

use crate::error::OrchestratorError;

const RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Held exclusive lock on a `*.lock` file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block up to `timeout` for an exclusive lock on `path`.
    ///
    /// Fails with `OrchestratorError::LockTimeout` when the wait expires.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        let started = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => {
                    trace!(path = %path.display(), waited_ms = started.elapsed().as_millis(), "lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(TryLockError::WouldBlock) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        warn!(path = %path.display(), ?waited, "lock wait timed out");
                        return Err(OrchestratorError::LockTimeout {
                            path: path.to_path_buf(),
                            waited,
                        }
                        .into());
                    }
                    thread::sleep(RETRY_INTERVAL.min(timeout - waited));
                }
                Err(TryLockError::Error(err)) => {
                    return Err(err).with_context(|| format!("lock {}", path.display()));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            debug!(path = %self.path.display(), err = %err, "unlock failed; released on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn second_acquire_times_out_while_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json.lock");
        let held = FileLock::acquire(&path, Duration::from_secs(1)).expect("first");

        let err = FileLock::acquire(&path, Duration::from_millis(100)).expect_err("contended");
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::LockTimeout { .. })
        ));

        drop(held);
        FileLock::acquire(&path, Duration::from_millis(100)).expect("released");
    }

    #[test]
    fn serializes_threads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("counter.lock");
        let inside = Arc::new(AtomicUsize::new(0));

        thread::scope(|scope| {
            for _ in 0..4 {
                let inside = Arc::clone(&inside);
                let path = path.clone();
                scope.spawn(move || {
                    for _ in 0..5 {
                        let _guard = FileLock::acquire(&path, Duration::from_secs(10)).expect("lock");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });
    }
}
