//! Execution collaborator: runs one rendered script inside a resolved
//! environment.

use crate::cancel::CancelToken;
use crate::env_cache::EnvironmentDescriptor;
use crate::expand::RunConfig;
use crate::provision::interpreter_in;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

pub struct ExecutionRequest<'a> {
    pub run: &'a RunConfig,
    pub environment: &'a EnvironmentDescriptor,
    /// Script with the run's bindings already injected.
    pub script: &'a Path,
    pub run_dir: &'a Path,
    /// Working directory of the run; outputs land here.
    pub artifact_dir: &'a Path,
    /// Combined stdout/stderr destination.
    pub log_path: &'a Path,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// `None` when the process ended without an exit code (signal).
    pub exit_code: Option<i32>,
    pub output_location: PathBuf,
    pub interrupted: bool,
}

pub trait Executor: Send + Sync {
    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<ExecutionOutcome>;
}

/// Spawns the environment's interpreter on the rendered script.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    poll_interval: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Executor for ProcessExecutor {
    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<ExecutionOutcome> {
        let python = interpreter_in(&request.environment.storage_location);
        let log = fs::File::create(request.log_path)
            .with_context(|| format!("failed to create {}", request.log_path.display()))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&python);
        cmd.arg("-u").arg(request.script);
        cmd.current_dir(request.artifact_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));
        cmd.env("PARAMIT_RUN_DIR", request.run_dir);
        cmd.env("PARAMIT_BATCH_INDEX", request.run.batch_index.to_string());
        cmd.env("PARAMIT_PARAMS", request.run.bindings_json().to_string());

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", python.display()))?;
        let (status, interrupted) = wait_or_cancel(child, request.cancel, self.poll_interval)?;
        Ok(ExecutionOutcome {
            exit_code: status.code(),
            output_location: request.artifact_dir.to_path_buf(),
            interrupted,
        })
    }
}

/// Wait for `child`, killing it once `cancel` fires.
fn wait_or_cancel(
    mut child: Child,
    cancel: &CancelToken,
    poll: Duration,
) -> Result<(ExitStatus, bool)> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let status = child.wait()?;
            return Ok((status, true));
        }
        thread::sleep(poll);
    }
}
