use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tokio::time::Instant;

/// Lock file name, fixed per host. The file is created on first use and
/// never deleted: unlinking a lock file while another process holds the
/// descriptor would let two holders coexist.
pub const LOCK_FILE_NAME: &str = "mount_unmount.lock";

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Host-scoped advisory exclusive lock serializing every mount/unmount
/// decision on this host, across processes. The kernel drops the lock if
/// the holding process dies.
#[derive(Debug, Clone)]
pub struct HostLock {
    path: PathBuf,
}

impl HostLock {
    pub fn new(lock_dir: impl AsRef<Path>) -> Self {
        Self {
            path: lock_dir.as_ref().join(LOCK_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, polling a non-blocking exclusive flock until it
    /// succeeds or the timeout elapses.
    pub async fn acquire(&self, timeout: Duration) -> Result<HostLockGuard, LockError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::trace!(path = %self.path.display(), "host lock acquired");
                    return Ok(HostLockGuard { file });
                }
                Err(e) if is_contended(&e) => {
                    if Instant::now() >= deadline {
                        return Err(LockError::Timeout(timeout));
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(LockError::Io(e)),
            }
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Held lock token. Unlocks on drop; the kernel also releases the lock
/// when the file descriptor closes, whatever the exit path.
#[derive(Debug)]
pub struct HostLockGuard {
    file: File,
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!("failed to release host lock: {}", e);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for the host mount lock")]
    Timeout(Duration),

    #[error("lock file I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_excludes_second_holder_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let lock = HostLock::new(dir.path());

        let guard = lock.acquire(Duration::from_secs(1)).await.unwrap();

        // A second handle on the same path must time out while the first
        // guard is held. Re-opening (not duplicating) the file matters:
        // a dup'd descriptor shares the lock.
        let second = HostLock::new(dir.path());
        let contended = second.acquire(Duration::from_millis(200)).await;
        assert!(matches!(contended, Err(LockError::Timeout(_))));

        drop(guard);
        let reacquired = second.acquire(Duration::from_secs(1)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn lock_file_is_created_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let lock = HostLock::new(dir.path());

        let guard = lock.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(lock.path().exists());
        drop(guard);
        assert!(lock.path().exists());
    }
}
