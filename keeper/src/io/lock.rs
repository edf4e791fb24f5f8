//! Exclusive advisory file locks with a bounded wait.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Exclusive lock on a lock file. Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquire the lock, polling until `wait` elapses.
    pub fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %path.display(), "lock acquired");
                    return Ok(Self { file });
                }
                Err(_) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(anyhow!(
                        "timed out after {}ms waiting for lock {}: {e}",
                        wait.as_millis(),
                        path.display()
                    ));
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock as well; unlock eagerly anyway.
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_waits_then_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/test.lock");
        let lock = FileLock::acquire(&path, Duration::from_millis(100)).expect("first");
        assert!(FileLock::acquire(&path, Duration::from_millis(100)).is_err());
        drop(lock);
        let _again = FileLock::acquire(&path, Duration::from_millis(100)).expect("after drop");
    }
}
