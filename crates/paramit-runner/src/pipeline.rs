//! Request handling up to the point where runs start: target dispatch,
//! analysis, synthesis, expansion and manifest resolution. Every analysis
//! and configuration error surfaces here, before any environment work.

use crate::analyzer::{analyze_path, ScriptAnalysis};
use crate::artifact::ConfigArtifact;
use crate::env_cache::EnvironmentCache;
use crate::error::{AnalysisError, ConfigError, EnvironmentError, ParamitError};
use crate::expand::{expand, ExperimentBatch};
use crate::manifest::DependencyManifest;
use crate::notebook;
use crate::orchestrator::{BatchPlan, BatchReport, Orchestrator};
use crate::synth::{synthesize, Override, ParameterSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// A `.py` script, `.ipynb` notebook or `.toml` configuration.
    pub target: PathBuf,
    pub overrides: Vec<Override>,
    /// Explicit dependency manifest; wins over the persisted one and over
    /// discovery.
    pub manifest: Option<PathBuf>,
    /// Write `<stem>.toml` beside a script that has none yet.
    pub write_default_config: bool,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub script_path: PathBuf,
    pub analysis: ScriptAnalysis,
    pub params: ParameterSet,
    pub batch: ExperimentBatch,
    pub manifest: DependencyManifest,
    /// Default configuration written beside the script on this call.
    pub generated_config: Option<PathBuf>,
}

impl Prepared {
    pub fn environment_key(&self, interpreter_pin: &str) -> String {
        EnvironmentCache::key(&self.manifest, interpreter_pin)
    }

    pub fn requires_confirmation(&self, threshold: usize) -> bool {
        self.batch.len() > threshold
    }

    pub fn into_plan(self, interpreter_pin: String) -> BatchPlan {
        BatchPlan {
            script_path: self.script_path,
            analysis: self.analysis,
            params: self.params,
            batch: self.batch,
            manifest: self.manifest,
            interpreter_pin,
        }
    }
}

enum Target {
    Script {
        path: PathBuf,
        sibling_config: PathBuf,
    },
    Config(ConfigArtifact),
}

fn classify(target: &Path) -> Result<Target, ParamitError> {
    match target.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(Target::Config(ConfigArtifact::load(target)?)),
        Some("py") | Some("ipynb") => Ok(Target::Script {
            path: target.to_path_buf(),
            sibling_config: target.with_extension("toml"),
        }),
        _ => Err(AnalysisError::UnsupportedInput {
            path: target.to_path_buf(),
        }
        .into()),
    }
}

fn canonical_script(path: &Path) -> Result<PathBuf, AnalysisError> {
    fs::canonicalize(path).map_err(|source| AnalysisError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn analyze_script(script: &Path) -> Result<ScriptAnalysis, AnalysisError> {
    let mut analysis = analyze_path(script)?;
    if let Some(dir) = script.parent() {
        analysis.schema.expand_existing_paths(dir);
    }
    Ok(analysis)
}

fn default_artifact(analysis: &ScriptAnalysis, script: &Path) -> Result<ConfigArtifact, ConfigError> {
    Ok(synthesize(&analysis.schema, script, None, &[])?.to_artifact())
}

pub fn prepare(request: &RunRequest) -> Result<Prepared, ParamitError> {
    let (script_path, persisted, sibling) = match classify(&request.target)? {
        Target::Config(artifact) => {
            let script = canonical_script(&artifact.script_reference)?;
            (script, Some(artifact), None)
        }
        Target::Script {
            path,
            sibling_config,
        } => {
            let script = canonical_script(&path)?;
            if sibling_config.is_file() {
                (script, Some(ConfigArtifact::load(&sibling_config)?), None)
            } else if request.write_default_config {
                (script, None, Some(sibling_config))
            } else {
                (script, None, None)
            }
        }
    };

    let analysis = analyze_script(&script_path)?;
    tracing::debug!(
        script = %script_path.display(),
        parameters = analysis.schema.len(),
        notebook = notebook::is_notebook(&script_path),
        "script analyzed"
    );

    let mut params = synthesize(
        &analysis.schema,
        &script_path,
        persisted.as_ref(),
        &request.overrides,
    )?;
    if let Some(manifest) = &request.manifest {
        // Persisted artifacts resolve relative paths against their own
        // directory, so a path relative to the caller's cwd must not leak in.
        let manifest = fs::canonicalize(manifest)
            .or_else(|_| std::path::absolute(manifest))
            .map_err(EnvironmentError::io(manifest))?;
        params.manifest_path = Some(manifest);
    }
    let batch = expand(&params)?;

    let generated_config = match sibling {
        Some(path) => {
            default_artifact(&analysis, &script_path)?.save(&path)?;
            tracing::info!(config = %path.display(), "wrote default configuration");
            Some(path)
        }
        None => None,
    };

    let script_dir = script_path.parent().unwrap_or(Path::new("."));
    let manifest = DependencyManifest::resolve(params.manifest_path.as_deref(), script_dir)?;

    Ok(Prepared {
        script_path,
        analysis,
        params,
        batch,
        manifest,
        generated_config,
    })
}

/// Prepare and execute a request in one step.
pub fn run(
    request: &RunRequest,
    interpreter_pin: &str,
    orchestrator: &Orchestrator<'_>,
    reports_root: &Path,
) -> Result<BatchReport, ParamitError> {
    let plan = prepare(request)?.into_plan(interpreter_pin.to_string());
    orchestrator.run_batch(&plan, reports_root)
}

/// Write the default configuration beside `script`. Returns its path.
pub fn init_config(script: &Path, force: bool) -> Result<PathBuf, ParamitError> {
    if !matches!(classify(script)?, Target::Script { .. }) {
        return Err(AnalysisError::UnsupportedInput {
            path: script.to_path_buf(),
        }
        .into());
    }
    let script_path = canonical_script(script)?;
    let target = script_path.with_extension("toml");
    if target.exists() && !force {
        return Err(ConfigError::ArtifactExists { path: target }.into());
    }
    let analysis = analyze_script(&script_path)?;
    default_artifact(&analysis, &script_path)?.save(&target)?;
    Ok(target)
}
