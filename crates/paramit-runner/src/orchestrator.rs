use crate::analyzer::ScriptAnalysis;
use crate::artifact::ConfigArtifact;
use crate::cancel::{CancelToken, StopWatcher};
use crate::env_cache::{EnvironmentCache, EnvironmentDescriptor};
use crate::error::{ParamitError, RunError};
use crate::executor::{ExecutionRequest, Executor};
use crate::expand::{ExperimentBatch, RunConfig};
use crate::manifest::DependencyManifest;
use crate::provision::Provisioner;
use crate::synth::ParameterSet;
use anyhow::Context;
use chrono::{DateTime, Utc};
use paramit_core::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir, scratch_suffix,
    sha256_bytes,
};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

/// Subdirectory of a run directory holding the dependency manifest copy.
pub const MANIFEST_COPY_DIR: &str = "manifest";

/// Everything needed to execute one batch, fully validated.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub script_path: PathBuf,
    pub analysis: ScriptAnalysis,
    pub params: ParameterSet,
    pub batch: ExperimentBatch,
    pub manifest: DependencyManifest,
    pub interpreter_pin: String,
}

impl BatchPlan {
    fn script_stem(&self) -> String {
        self.script_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "script".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub schema_version: String,
    pub batch_index: usize,
    #[serde(skip)]
    pub run_config: RunConfig,
    pub parameters: serde_json::Value,
    /// Digest of `parameters`; equal digests mean identical bindings.
    pub config_digest: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunError>,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_dir: PathBuf,
    pub log_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_version: Option<String>,
}

impl RunResult {
    pub fn is_interrupted(&self) -> bool {
        self.failure.as_ref().is_some_and(RunError::is_interrupted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub batch_dir: PathBuf,
    pub manifest_hash: String,
    pub cache_hit: bool,
    pub results: Vec<RunResult>,
    /// Batch indices never started because the batch was interrupted.
    pub not_started: Vec<usize>,
    pub interrupted: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == RunStatus::Succeeded)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

struct BatchGuard {
    path: PathBuf,
    summary: serde_json::Value,
    done: bool,
}

impl BatchGuard {
    fn new(path: PathBuf, summary: serde_json::Value) -> Result<Self, ParamitError> {
        let guard = Self {
            path,
            summary,
            done: false,
        };
        guard.write("running", json!({}))?;
        Ok(guard)
    }

    fn write(&self, status: &str, extra: serde_json::Value) -> Result<(), ParamitError> {
        let mut payload = self.summary.clone();
        if let (Some(target), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
            target.insert("status".to_string(), json!(status));
            target.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }
        atomic_write_json_pretty(&self.path, &payload).map_err(ParamitError::report(&self.path))
    }

    fn complete(&mut self, status: &str, extra: serde_json::Value) -> Result<(), ParamitError> {
        self.write(status, extra)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.write("failed", json!({}));
        }
    }
}

/// Drives a batch: one environment resolution, then every run through a
/// bounded worker pool. Results are slotted by batch position, so reports
/// never depend on completion order.
pub struct Orchestrator<'a> {
    cache: &'a EnvironmentCache,
    provisioner: &'a dyn Provisioner,
    executor: &'a dyn Executor,
    workers: usize,
    cancel: CancelToken,
    cuda_version: Option<String>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        cache: &'a EnvironmentCache,
        provisioner: &'a dyn Provisioner,
        executor: &'a dyn Executor,
    ) -> Self {
        Self {
            cache,
            provisioner,
            executor,
            workers: 1,
            cancel: CancelToken::new(),
            cuda_version: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_cuda_version(mut self, cuda_version: Option<String>) -> Self {
        self.cuda_version = cuda_version;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn run_batch(&self, plan: &BatchPlan, reports_root: &Path) -> Result<BatchReport, ParamitError> {
        let script_label = plan.script_path.to_string_lossy().to_string();
        let tag = sha256_bytes(format!("{}:{}", scratch_suffix(), script_label).as_bytes());
        let batch_id = format!("batch_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &tag[..8]);
        let batch_dir = reports_root.join(&batch_id);
        ensure_dir(&batch_dir).map_err(ParamitError::report(&batch_dir))?;

        let request_path = batch_dir.join("request.toml");
        atomic_write_bytes(&request_path, plan.params.to_artifact().to_toml_string().as_bytes())
            .map_err(ParamitError::report(&request_path))?;

        let total = plan.batch.len();
        let mut guard = BatchGuard::new(
            batch_dir.join("batch.json"),
            json!({
                "schema_version": "batch_v1",
                "batch_id": batch_id,
                "script": script_label,
                "manifest_path": plan.manifest.path,
                "interpreter": plan.interpreter_pin,
                "total_runs": total,
                "axes": plan.batch.axes,
                "created_at": Utc::now().to_rfc3339(),
            }),
        )?;
        tracing::info!(batch = %batch_id, runs = total, workers = self.workers, "batch started");

        let resolution = match self
            .cache
            .resolve(&plan.manifest, &plan.interpreter_pin, self.provisioner)
        {
            Ok(resolution) => resolution,
            Err(err) => {
                guard.complete(
                    "environment_failed",
                    json!({"error": err.to_string(), "not_started": (0..total).collect::<Vec<_>>()}),
                )?;
                return Err(err.into());
            }
        };
        let environment = &resolution.descriptor;

        let watcher = StopWatcher::spawn(&batch_dir, self.cancel.clone());
        let slots: Vec<Mutex<Option<RunResult>>> = (0..total).map(|_| Mutex::new(None)).collect();
        let cursor = AtomicUsize::new(0);
        let stem = plan.script_stem();

        thread::scope(|scope| {
            for _ in 0..self.workers.min(total) {
                scope.spawn(|| loop {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let position = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(run) = plan.batch.runs.get(position) else {
                        break;
                    };
                    let result = self.run_one(plan, run, environment, &batch_dir, &stem);
                    let mut slot = slots[position]
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    *slot = Some(result);
                });
            }
        });
        drop(watcher);

        let mut results = Vec::with_capacity(total);
        let mut not_started = Vec::new();
        for (slot, run) in slots.into_iter().zip(&plan.batch.runs) {
            match slot.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()) {
                Some(result) => results.push(result),
                None => not_started.push(run.batch_index),
            }
        }

        let report = BatchReport {
            batch_id,
            batch_dir,
            manifest_hash: environment.manifest_hash.clone(),
            cache_hit: resolution.cache_hit,
            interrupted: self.cancel.is_cancelled(),
            results,
            not_started,
        };
        let status = if report.interrupted { "interrupted" } else { "completed" };
        guard.complete(
            status,
            json!({
                "manifest_hash": report.manifest_hash,
                "cache_hit": report.cache_hit,
                "succeeded": report.succeeded(),
                "failed": report.failed(),
                "not_started": report.not_started,
                "runs": report.results.iter().map(|r| json!({
                    "batch_index": r.batch_index,
                    "status": r.status,
                    "run_dir": r.run_dir,
                })).collect::<Vec<_>>(),
            }),
        )?;
        tracing::info!(
            batch = %report.batch_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            not_started = report.not_started.len(),
            "batch finished"
        );
        Ok(report)
    }

    fn run_one(
        &self,
        plan: &BatchPlan,
        run: &RunConfig,
        environment: &EnvironmentDescriptor,
        batch_dir: &Path,
        stem: &str,
    ) -> RunResult {
        let slug = run.slug(&plan.batch.axes);
        let dir_name = if slug.is_empty() {
            format!("run_{:04}", run.batch_index)
        } else {
            format!("run_{:04}_{}", run.batch_index, slug)
        };
        let run_dir = batch_dir.join(dir_name);
        let artifact_dir = run_dir.join("artifacts");
        let log_path = run_dir.join("console.log");
        let started_at = Utc::now();

        let outcome = self
            .stage_run(plan, run, &run_dir, &artifact_dir, stem)
            .and_then(|script| {
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                let request = ExecutionRequest {
                    run,
                    environment,
                    script: &script,
                    run_dir: &run_dir,
                    artifact_dir: &artifact_dir,
                    log_path: &log_path,
                    cancel: &self.cancel,
                };
                self.executor.execute(&request).map(Some)
            });

        let batch_index = run.batch_index;
        let (exit_code, failure) = match outcome {
            // A terminal Ctrl-C reaches the child too, so a run that dies
            // while the batch is cancelling counts as interrupted.
            Ok(Some(o))
                if o.interrupted || (o.exit_code != Some(0) && self.cancel.is_cancelled()) =>
            {
                (o.exit_code, Some(RunError::Interrupted { batch_index }))
            }
            Ok(Some(o)) => match o.exit_code {
                Some(0) => (Some(0), None),
                Some(code) => (Some(code), Some(RunError::NonZeroExit { batch_index, code })),
                None => (None, Some(RunError::Signal { batch_index })),
            },
            Ok(None) => (None, Some(RunError::Interrupted { batch_index })),
            Err(err) => (
                None,
                Some(RunError::Executor {
                    batch_index,
                    message: format!("{err:#}"),
                }),
            ),
        };

        let parameters = run.bindings_json();
        let result = RunResult {
            schema_version: "run_result_v1".to_string(),
            batch_index,
            config_digest: canonical_json_digest(&parameters),
            parameters,
            run_config: run.clone(),
            status: if failure.is_none() {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            },
            failure,
            exit_code,
            started_at,
            finished_at: Utc::now(),
            run_dir: run_dir.clone(),
            log_path,
            artifact_dir,
            environment: environment.manifest_hash.clone(),
            cuda_version: self.cuda_version.clone(),
        };
        let meta_path = run_dir.join("run.json");
        if let Err(err) = atomic_write_json_pretty(&meta_path, &result) {
            tracing::warn!(path = %meta_path.display(), error = %err, "failed to write run metadata");
        }
        match &result.failure {
            None => tracing::info!(batch_index, "run succeeded"),
            Some(failure) => tracing::warn!(batch_index, %failure, "run failed"),
        }
        result
    }

    /// Create the run directory, its configuration snapshot, the rendered
    /// script and a manifest copy. Returns the rendered script path.
    fn stage_run(
        &self,
        plan: &BatchPlan,
        run: &RunConfig,
        run_dir: &Path,
        artifact_dir: &Path,
        stem: &str,
    ) -> anyhow::Result<PathBuf> {
        ensure_dir(artifact_dir)
            .with_context(|| format!("failed to create {}", artifact_dir.display()))?;
        ConfigArtifact::from_run_config(run).save(&run_dir.join(format!("{stem}.toml")))?;

        let script = run_dir.join(format!("{stem}.py"));
        let rendered = plan.analysis.render(run.iter_bindings());
        atomic_write_bytes(&script, rendered.as_bytes())
            .with_context(|| format!("failed to write {}", script.display()))?;

        // Kept out of the run directory's top level, where `pyproject.toml`
        // would collide with the snapshot of a script named `pyproject.py`.
        if let (Some(source), Some(name)) = (plan.manifest.path.as_deref(), plan.manifest.file_name()) {
            let manifest_dir = run_dir.join(MANIFEST_COPY_DIR);
            ensure_dir(&manifest_dir)
                .with_context(|| format!("failed to create {}", manifest_dir.display()))?;
            fs::copy(source, manifest_dir.join(name))
                .with_context(|| format!("failed to copy manifest {}", source.display()))?;
        }
        Ok(script)
    }
}
