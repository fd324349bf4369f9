use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

const LOCK_FILE: &str = "rotation.lock";

/// Cross-process mutual exclusion for credential rotation.
///
/// The lock is a file in the shared session directory, claimed atomically
/// with `create_new` (`O_CREAT|O_EXCL`). Every process of the session sees
/// the same file, so at most one rotation call fires cluster-wide. A lock
/// older than `max_age` belongs to a holder that crashed mid-rotation and
/// may be broken.
#[derive(Debug, Clone)]
pub struct RotationLock {
    path: PathBuf,
    max_age: Duration,
}

impl RotationLock {
    pub fn new(session_dir: &Path, max_age: Duration) -> Self {
        Self {
            path: session_dir.join(LOCK_FILE),
            max_age,
        }
    }

    /// Atomically claim the lock. Returns `None` when another live holder
    /// already has it.
    pub fn try_claim(&self) -> std::io::Result<Option<LockGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match self.create_marker() {
            Ok(()) => Ok(Some(LockGuard {
                path: self.path.clone(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.is_stale()? {
                    warn!(path = %self.path.display(), "breaking abandoned rotation lock");
                    remove_quiet(&self.path)?;
                    // Retry once; losing this second race just means another
                    // process broke the same stale lock first.
                    match self.create_marker() {
                        Ok(()) => Ok(Some(LockGuard {
                            path: self.path.clone(),
                        })),
                        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
                        Err(err) => Err(err),
                    }
                } else {
                    Ok(None)
                }
            }
            Err(err) => Err(err),
        }
    }

    fn create_marker(&self) -> std::io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        // Holder identity, for post-mortems only.
        writeln!(file, "pid={}", std::process::id())
    }

    /// Whether some process currently holds a live (non-stale) lock.
    pub fn is_held(&self) -> std::io::Result<bool> {
        match std::fs::metadata(&self.path) {
            Ok(_) => Ok(!self.is_stale()?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn is_stale(&self) -> std::io::Result<bool> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        let modified = meta.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        Ok(age > self.max_age)
    }
}

/// Held rotation lock; releasing removes the marker file. Dropped guards
/// release as well, so a panicking rotation never wedges other processes.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = remove_quiet(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release rotation lock");
        } else {
            debug!(path = %self.path.display(), "rotation lock released");
        }
    }
}

fn remove_quiet(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
