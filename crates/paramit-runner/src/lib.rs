//! Parameter extraction, configuration synthesis, grid expansion and
//! environment caching for plain scripts.

pub mod analyzer;
pub mod artifact;
pub mod cancel;
pub mod env_cache;
pub mod error;
pub mod executor;
pub mod expand;
pub mod kind;
mod lock;
pub mod manifest;
mod notebook;
pub mod orchestrator;
pub mod pipeline;
pub mod provision;
pub mod settings;
pub mod synth;
pub mod toolchain;

pub use analyzer::{analyze_path, analyze_source, Parameter, Schema, ScriptAnalysis};
pub use artifact::{ConfigArtifact, CONFIG_SCHEMA_VERSION};
pub use cancel::{request_stop, CancelToken};
pub use env_cache::{CacheEntry, ClearSummary, EnvStatus, EnvironmentCache, EnvironmentDescriptor};
pub use error::{AnalysisError, ConfigError, EnvironmentError, ParamitError, RunError};
pub use executor::{ExecutionOutcome, ExecutionRequest, Executor, ProcessExecutor};
pub use expand::{axis_summary, expand, AxisSummary, ExperimentBatch, ParameterBinding, RunConfig};
pub use kind::{ParamKind, ParamValue};
pub use manifest::DependencyManifest;
pub use orchestrator::{BatchPlan, BatchReport, Orchestrator, RunResult, RunStatus};
pub use pipeline::{init_config, prepare, run, Prepared, RunRequest};
pub use provision::{Provisioner, VenvProvisioner};
pub use settings::Settings;
pub use synth::{parse_override_args, synthesize, Override, ParamEntry, ParameterSet};
pub use toolchain::Interpreter;
