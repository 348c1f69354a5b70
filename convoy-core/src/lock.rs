//! Locking primitives
//!
//! Two primitives back every shared resource in the pipeline: an advisory
//! cross-process lock on a file path, used around the feature file, and a
//! cooperative in-process mutex whose wait queue is FIFO, used for the git
//! repository and the merge-verify window.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::{Error, Result};

const LOCK_MAX_ATTEMPTS: u32 = 5;
const LOCK_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const LOCK_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Advisory cross-process lock on a file path
///
/// Acquired with bounded retries and exponential backoff; released on drop,
/// so every exit path releases.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock, retrying up to 5 times with backoff 100ms -> 2s
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut backoff = LOCK_INITIAL_BACKOFF;

        for attempt in 1..=LOCK_MAX_ATTEMPTS {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;

            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file, path }),
                Err(_) if attempt < LOCK_MAX_ATTEMPTS => {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(LOCK_MAX_BACKOFF);
                }
                Err(e) => {
                    return Err(Error::Lock(format!(
                        "could not lock {} after {} attempts: {}",
                        path.display(),
                        LOCK_MAX_ATTEMPTS,
                        e
                    )));
                }
            }
        }

        unreachable!("lock loop returns on every path")
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

/// Cooperative in-process mutex with FIFO handoff
///
/// Built on a single-permit [`Semaphore`], whose wait queue is fair: release
/// hands the permit to the earliest waiter. Never fails an operation, only
/// blocks.
pub struct FifoMutex {
    sem: Semaphore,
}

/// Guard for [`FifoMutex`]; releases on drop
pub struct FifoMutexGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

impl FifoMutex {
    pub fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
        }
    }

    /// Wait for the lock; waiters are served in arrival order
    pub async fn lock(&self) -> FifoMutexGuard<'_> {
        // The semaphore is never closed, so acquire cannot fail.
        let permit = self
            .sem
            .acquire()
            .await
            .expect("FifoMutex semaphore closed");
        FifoMutexGuard { _permit: permit }
    }

    /// Whether the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.sem.available_permits() == 0
    }
}

impl Default for FifoMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FifoMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_file_lock_acquire_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json.lock");

        let lock = FileLock::acquire(&path).unwrap();
        assert!(path.exists());
        drop(lock);

        // Reacquirable after release
        let lock = FileLock::acquire(&path).unwrap();
        drop(lock);
    }

    #[test]
    fn test_file_lock_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("f.lock");
        let lock = FileLock::acquire(&path).unwrap();
        assert!(path.exists());
        drop(lock);
    }

    #[tokio::test]
    async fn test_fifo_mutex_exclusion() {
        let mutex = Arc::new(FifoMutex::new());

        let guard = mutex.lock().await;
        assert!(mutex.is_locked());
        drop(guard);
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn test_fifo_mutex_handoff_order() {
        let mutex = Arc::new(FifoMutex::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = mutex.lock().await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let mutex = Arc::clone(&mutex);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = mutex.lock().await;
                order.lock().unwrap().push(i);
            }));
            // Let each task reach the wait queue before the next spawns
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
