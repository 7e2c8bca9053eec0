//! Cross-process build lock: an OS advisory lock on a per-hash lock file.
//! The kernel drops it when the holder exits, crashed or not, so there is
//! no stale state to reclaim. The file itself persists; only the lock on it
//! carries meaning. The owner's pid is written into it for diagnostics.

use crate::error::EnvironmentError;
use chrono::Utc;
use paramit_core::ensure_dir;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, TryLockError};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    acquired_at: String,
}

/// Held for as long as the value lives; dropping the file handle unlocks.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
}

impl BuildLock {
    /// Take the lock if it is free. `None` while another holder has it.
    pub fn try_acquire(path: &Path) -> Result<Option<BuildLock>, EnvironmentError> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent).map_err(EnvironmentError::io(parent))?;
        }
        // Never truncate on open: the current holder's pid lives in there.
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(EnvironmentError::io(path))?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Error(e)) => return Err(EnvironmentError::io(path)(e)),
        }

        let owner = LockOwner {
            pid: std::process::id(),
            acquired_at: Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_vec(&owner).unwrap_or_default();
        let recorded = file
            .set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(&payload));
        if let Err(err) = recorded {
            tracing::debug!(lock = %path.display(), error = %err, "could not record lock owner");
        }
        Ok(Some(BuildLock { _file: file }))
    }

    /// Block until the lock is ours or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<BuildLock, EnvironmentError> {
        let started = Instant::now();
        let mut announced = false;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                tracing::debug!(lock = %path.display(), "build lock acquired");
                return Ok(lock);
            }
            if started.elapsed() >= timeout {
                return Err(EnvironmentError::LockTimeout {
                    path: path.to_path_buf(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            if !announced {
                tracing::info!(
                    lock = %path.display(),
                    owner = ?owner_pid(path),
                    "waiting for in-flight environment build"
                );
                announced = true;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Whether some holder currently has the lock at `path`.
    pub fn is_held(path: &Path) -> bool {
        let Ok(file) = fs::OpenOptions::new().read(true).write(true).open(path) else {
            return false;
        };
        matches!(file.try_lock(), Err(TryLockError::WouldBlock))
    }
}

fn owner_pid(path: &Path) -> Option<u32> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice::<LockOwner>(&raw).ok().map(|o| o.pid)
}
