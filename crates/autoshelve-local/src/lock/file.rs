use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use autoshelve_core::{ShelveError, ShelveResult};
use fs2::FileExt;
use tracing::{debug, instrument};

/// Attempts before giving up on a contended lock.
const MAX_ATTEMPTS: u32 = 200;

/// Exclusive OS-level lock on a single lock file.
///
/// Another process holding the lock makes [`acquire`](Self::acquire) retry
/// with a growing delay. A crashed holder releases the lock implicitly, since
/// the OS closes its descriptors.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

/// Held lock; dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn open(&self) -> ShelveResult<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ShelveError::Io(format!(
                    "Failed to create lock dir {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| ShelveError::Lock(format!("Failed to open lock file: {}", e)))
    }

    /// Try once; `None` when another holder has the lock.
    pub fn try_acquire(&self) -> ShelveResult<Option<LockGuard>> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired lock {}", self.path.display());
                Ok(Some(LockGuard {
                    file,
                    path: self.path.clone(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(ShelveError::Lock(format!("Failed to acquire lock: {}", e))),
        }
    }

    /// Acquire the lock, waiting for other holders.
    #[instrument(skip(self), fields(path = %self.path.display()), level = "debug")]
    pub async fn acquire(&self) -> ShelveResult<LockGuard> {
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = 5 + u64::from(attempt.min(20)) * 5;
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            debug!("Lock {} held elsewhere (attempt {})", self.path.display(), attempt + 1);
        }
        Err(ShelveError::Lock(format!(
            "Timed out waiting for {}",
            self.path.display()
        )))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released lock {}", self.path.display());
    }
}
