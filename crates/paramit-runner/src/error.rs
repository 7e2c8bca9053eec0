use crate::kind::ParamKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// The script could not be read or is not syntactically valid.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("cannot read script {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{origin}:{line}:{column}: syntax error: {detail}")]
    Syntax {
        origin: String,
        line: usize,
        column: usize,
        detail: String,
    },

    #[error("notebook {path} is malformed: {detail}")]
    Notebook { path: PathBuf, detail: String },

    #[error("unsupported input {path}: expected a .py script, .ipynb notebook or .toml config")]
    UnsupportedInput { path: PathBuf },
}

/// The parameter request is ill-formed. Always raised before any run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown parameter `{name}`: not found in the script or its config")]
    UnknownParameter { name: String },

    #[error("invalid value `{value}` for parameter `{name}`: expected {expected}")]
    InvalidValue {
        name: String,
        value: String,
        expected: ParamKind,
    },

    #[error("no values supplied for parameter `{name}`")]
    NoValues { name: String },

    #[error("unexpected argument `{arg}`: values must follow a --<parameter-name> flag")]
    UnexpectedArgument { arg: String },

    #[error("malformed configuration {path}: {detail}")]
    MalformedArtifact { path: PathBuf, detail: String },

    #[error("cannot access configuration {path}: {source}")]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration {path} already exists (use --force to overwrite)")]
    ArtifactExists { path: PathBuf },

    #[error("grid expansion overflows: too many combinations")]
    ExpansionOverflow,
}

/// Environment resolution failed; fatal to every run sharing the manifest.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("invalid dependency manifest {path}: {detail}")]
    InvalidManifest { path: PathBuf, detail: String },

    #[error("interpreter `{program}` is unavailable: {detail}")]
    Interpreter { program: String, detail: String },

    #[error("provisioning environment {manifest_hash} failed: {detail}\n--- manifest ---\n{manifest}")]
    Provisioning {
        manifest_hash: String,
        manifest: String,
        detail: String,
    },

    #[error("timed out after {waited_secs}s waiting for build lock {path}")]
    LockTimeout { path: PathBuf, waited_secs: u64 },

    #[error("environment {manifest_hash} is locked by an in-flight build")]
    Busy { manifest_hash: String },

    #[error("`{manifest_hash}` is not an environment key")]
    InvalidKey { manifest_hash: String },

    #[error("corrupt environment descriptor {path}: {detail}")]
    CorruptDescriptor { path: PathBuf, detail: String },

    #[error("environment cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EnvironmentError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| EnvironmentError::Io { path, source }
    }
}

/// Why a single run ended up `Failed`. Recorded in its `RunResult`, never
/// raised: one bad combination must not cancel the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
    #[error("run {batch_index} exited with status {code}")]
    NonZeroExit { batch_index: usize, code: i32 },

    #[error("run {batch_index} was terminated by a signal")]
    Signal { batch_index: usize },

    #[error("run {batch_index} was interrupted")]
    Interrupted { batch_index: usize },

    #[error("run {batch_index} could not be executed: {message}")]
    Executor { batch_index: usize, message: String },
}

impl RunError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunError::Interrupted { .. })
    }
}

#[derive(Debug, Error)]
pub enum ParamitError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error("cannot write report {path}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ParamitError {
    pub(crate) fn report(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ParamitError::Report { path, source }
    }

    /// Short machine-readable class used by the CLI's JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ParamitError::Analysis(_) => "analysis_error",
            ParamitError::Config(_) => "config_error",
            ParamitError::Environment(_) => "environment_error",
            ParamitError::Report { .. } => "report_error",
        }
    }
}
