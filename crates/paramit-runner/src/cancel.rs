//! Batch interruption: an in-process flag plus a `STOP` file that other
//! processes (`paramit stop`) can drop into a batch directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const STOP_FILE: &str = "STOP";

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub fn stop_file(batch_dir: &Path) -> PathBuf {
    batch_dir.join(STOP_FILE)
}

/// Ask the orchestrator owning `batch_dir` to stop.
pub fn request_stop(batch_dir: &Path) -> io::Result<()> {
    if !batch_dir.join("batch.json").is_file() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a batch directory", batch_dir.display()),
        ));
    }
    fs::write(stop_file(batch_dir), b"stop\n")
}

/// Polls for the stop file until the token is cancelled or `done` is set.
pub struct StopWatcher {
    done: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StopWatcher {
    pub fn spawn(batch_dir: &Path, token: CancelToken) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let path = stop_file(batch_dir);
        let finished = Arc::clone(&done);
        let handle = thread::spawn(move || {
            while !finished.load(Ordering::SeqCst) && !token.is_cancelled() {
                if path.exists() {
                    tracing::warn!(stop_file = %path.display(), "stop requested; interrupting batch");
                    token.cancel();
                    break;
                }
                thread::sleep(Duration::from_millis(250));
            }
        });
        Self {
            done,
            handle: Some(handle),
        }
    }
}

impl Drop for StopWatcher {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn stop_file_cancels_token() {
        let dir = std::env::temp_dir().join(format!(
            "paramit_cancel_{}",
            paramit_core::scratch_suffix()
        ));
        paramit_core::ensure_dir(&dir).expect("dir");
        fs::write(dir.join("batch.json"), "{}").expect("batch");

        let token = CancelToken::new();
        let watcher = StopWatcher::spawn(&dir, token.clone());
        assert!(!token.is_cancelled());
        request_stop(&dir).expect("stop");

        let started = Instant::now();
        while !token.is_cancelled() && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(token.is_cancelled());
        drop(watcher);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn request_stop_needs_a_batch_dir() {
        let dir = std::env::temp_dir().join("paramit_cancel_not_a_batch");
        assert!(request_stop(&dir).is_err());
    }
}
