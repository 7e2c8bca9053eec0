use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use paramit_runner::{
    axis_summary, init_config, parse_override_args, prepare, request_stop, toolchain, BatchReport,
    CancelToken, EnvironmentCache, Interpreter, Orchestrator, ParamitError, Prepared,
    ProcessExecutor, RunRequest, Settings, VenvProvisioner,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "paramit",
    version,
    about = "Turn plain scripts into parameterised, reproducible experiments"
)]
struct Cli {
    /// Settings file (default: ./paramit.yaml if present)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script, notebook or saved configuration. Parameter overrides
    /// follow the target: `--name value`, `--name v1,v2` or `--name v1 v2`.
    /// Options taking a value (`--workers`, `--reports`, `--manifest`) must
    /// come before the target; `--json` and `--yes` may go anywhere.
    Run {
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        reports: Option<PathBuf>,
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Confirm batches larger than the configured threshold
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
        target: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
    },
    /// Show the parameter schema and the batch a request would expand to.
    Describe {
        #[arg(long)]
        manifest: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        target: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
    },
    /// Write the default configuration file beside a script.
    InitConfig {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
        script: PathBuf,
    },
    CacheList {
        #[arg(long)]
        json: bool,
    },
    CacheClear {
        /// Remove only this environment
        #[arg(long)]
        hash: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Interrupt the batch running in BATCH_DIR.
    Stop {
        batch_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

struct Outcome {
    payload: Option<Value>,
    exit_code: i32,
}

impl Outcome {
    fn done() -> Self {
        Self {
            payload: None,
            exit_code: 0,
        }
    }

    fn json(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            exit_code: 0,
        }
    }
}

fn main() -> Result<()> {
    let mut cli = Cli::parse();
    hoist_trailing_flags(&mut cli.command);
    init_logging(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command, cli.settings.as_deref());
    match result {
        Ok(outcome) => {
            if let Some(payload) = &outcome.payload {
                emit_json(payload);
            }
            if outcome.exit_code != 0 {
                std::process::exit(outcome.exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<ParamitError>()
                    .map(ParamitError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{err:#}"), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Everything after the target lands in `params`. An override always
/// carries a value, so a bare `--json` or `--yes` there can only be the
/// command's own switch.
fn hoist_trailing_flags(command: &mut Commands) {
    match command {
        Commands::Run {
            yes, json, params, ..
        } => {
            *json |= take_flag(params, "--json");
            *yes |= take_flag(params, "--yes");
        }
        Commands::Describe { json, params, .. } => {
            *json |= take_flag(params, "--json");
        }
        _ => {}
    }
}

fn take_flag(params: &mut Vec<String>, flag: &str) -> bool {
    let before = params.len();
    params.retain(|p| p != flag);
    params.len() != before
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

fn run_command(command: Commands, settings_path: Option<&Path>) -> Result<Outcome> {
    let settings = Settings::load(settings_path)?;
    match command {
        Commands::Run {
            workers,
            reports,
            manifest,
            yes,
            json,
            target,
            params,
        } => {
            let request = RunRequest {
                target,
                overrides: parse_override_args(&params).map_err(ParamitError::from)?,
                manifest,
                write_default_config: true,
            };
            let prepared = prepare(&request)?;
            if let Some(path) = &prepared.generated_config {
                if !json {
                    println!("config: wrote {}", path.display());
                }
            }
            if prepared.requires_confirmation(settings.confirm_threshold) && !yes {
                bail!(
                    "batch expands to {} runs (more than {}); re-run with --yes to proceed",
                    prepared.batch.len(),
                    settings.confirm_threshold
                );
            }

            let interpreter = Interpreter::resolve(&settings.python);
            let pin = interpreter.version_pin().map_err(ParamitError::from)?;
            let cache = EnvironmentCache::init(&settings.cache_root())
                .map_err(ParamitError::from)?
                .with_lock_timeout(settings.lock_timeout());
            let provisioner = VenvProvisioner::new(interpreter);
            let executor = ProcessExecutor::new();
            let orchestrator = Orchestrator::new(&cache, &provisioner, &executor)
                .with_workers(workers.unwrap_or(settings.workers))
                .with_cuda_version(toolchain::probe_cuda_version());
            let reports_root = reports.unwrap_or_else(|| settings.reports_dir.clone());
            install_interrupt_handler(orchestrator.cancel_token());

            let plan = prepared.into_plan(pin);
            let report = orchestrator.run_batch(&plan, &reports_root)?;
            let exit_code = if report.failed() > 0 || !report.not_started.is_empty() {
                1
            } else {
                0
            };
            if json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": exit_code == 0,
                        "command": "run",
                        "batch": batch_report_to_json(&report),
                    })),
                    exit_code,
                });
            }
            print_batch_report(&report);
            Ok(Outcome {
                payload: None,
                exit_code,
            })
        }
        Commands::Describe {
            manifest,
            json,
            target,
            params,
        } => {
            let request = RunRequest {
                target,
                overrides: parse_override_args(&params).map_err(ParamitError::from)?,
                manifest,
                write_default_config: false,
            };
            let prepared = prepare(&request)?;
            let pin = match Interpreter::resolve(&settings.python).version_pin() {
                Ok(pin) => Some(pin),
                Err(err) => {
                    tracing::warn!(error = %err, "cannot derive environment key");
                    None
                }
            };
            if json {
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": describe_to_json(&prepared, pin.as_deref()),
                })));
            }
            print_describe(&prepared, pin.as_deref());
            Ok(Outcome::done())
        }
        Commands::InitConfig {
            force,
            json,
            script,
        } => {
            let path = init_config(&script, force)?;
            if json {
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "init-config",
                    "config": path.display().to_string(),
                })));
            }
            println!("config: {}", path.display());
            Ok(Outcome::done())
        }
        Commands::CacheList { json } => {
            let cache = EnvironmentCache::init(&settings.cache_root()).map_err(ParamitError::from)?;
            let entries = cache.list().map_err(ParamitError::from)?;
            if json {
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "cache-list",
                    "cache_dir": cache.root().display().to_string(),
                    "entries": entries,
                })));
            }
            println!("cache_dir: {}", cache.root().display());
            if entries.is_empty() {
                println!("(empty)");
            }
            for entry in &entries {
                let status = entry
                    .descriptor
                    .as_ref()
                    .map(|d| format!("{:?}", d.status).to_lowercase())
                    .unwrap_or_else(|| "unknown".to_string());
                let pin = entry
                    .descriptor
                    .as_ref()
                    .map(|d| d.interpreter_version_pin.as_str())
                    .unwrap_or("-");
                println!(
                    "{}  {:<8}  python {:<10}  {:>10}{}",
                    &entry.manifest_hash[..entry.manifest_hash.len().min(16)],
                    status,
                    pin,
                    human_bytes(entry.size_bytes),
                    if entry.locked { "  (building)" } else { "" }
                );
            }
            Ok(Outcome::done())
        }
        Commands::CacheClear { hash, json } => {
            let cache = EnvironmentCache::init(&settings.cache_root()).map_err(ParamitError::from)?;
            let payload = match hash {
                Some(hash) => {
                    let removed = cache.remove(&hash).map_err(ParamitError::from)?;
                    json!({"removed": if removed { vec![hash] } else { Vec::new() }, "skipped_locked": []})
                }
                None => serde_json::to_value(cache.clear().map_err(ParamitError::from)?)?,
            };
            if json {
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "cache-clear",
                    "result": payload,
                })));
            }
            let count = |key: &str| payload[key].as_array().map_or(0, Vec::len);
            println!("removed: {}", count("removed"));
            if count("skipped_locked") > 0 {
                println!("skipped (build in progress): {}", count("skipped_locked"));
            }
            Ok(Outcome::done())
        }
        Commands::Stop { batch_dir, json } => {
            request_stop(&batch_dir)?;
            if json {
                return Ok(Outcome::json(json!({
                    "ok": true,
                    "command": "stop",
                    "batch_dir": batch_dir.display().to_string(),
                })));
            }
            println!("stop requested: {}", batch_dir.display());
            Ok(Outcome::done())
        }
    }
}

/// First Ctrl-C cancels the batch so in-flight runs are recorded as
/// interrupted; a second one exits immediately.
fn install_interrupt_handler(cancel: &CancelToken) {
    let cancel = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("interrupt received; stopping batch (press Ctrl-C again to abort)");
        cancel.cancel();
    });
    if let Err(err) = installed {
        tracing::warn!(error = %err, "cannot install interrupt handler");
    }
}

fn describe_to_json(prepared: &Prepared, pin: Option<&str>) -> Value {
    let parameters: Vec<Value> = prepared
        .analysis
        .schema
        .parameters()
        .iter()
        .map(|p| {
            let entry = prepared.params.get(&p.name);
            json!({
                "name": p.name,
                "kind": p.kind.to_string(),
                "default": p.default.to_json(),
                "line": p.line,
                "candidates": entry.map(|e| e.candidates.iter().map(|v| v.to_json()).collect::<Vec<_>>()),
                "multi": entry.is_some_and(|e| e.multi),
            })
        })
        .collect();
    json!({
        "script": prepared.script_path.display().to_string(),
        "parameters": parameters,
        "axes": prepared.batch.axes,
        "candidate_counts": axis_summary(&prepared.params),
        "total_runs": prepared.batch.len(),
        "manifest": prepared.manifest.path.as_ref().map(|p| p.display().to_string()),
        "manifest_kind": prepared.manifest.kind,
        "environment_key": pin.map(|pin| prepared.environment_key(pin)),
        "interpreter": pin,
    })
}

fn print_describe(prepared: &Prepared, pin: Option<&str>) {
    println!("script: {}", prepared.script_path.display());
    println!("parameters:");
    for entry in &prepared.params.entries {
        let values: Vec<String> = entry.candidates.iter().map(|v| v.to_string()).collect();
        println!(
            "  {} ({}) = {}{}",
            entry.name,
            entry.kind,
            values.join(", "),
            if entry.multi { "  [grid]" } else { "" }
        );
    }
    println!("total_runs: {}", prepared.batch.len());
    match &prepared.manifest.path {
        Some(path) => println!("manifest: {}", path.display()),
        None => println!("manifest: none (bare interpreter)"),
    }
    if let Some(pin) = pin {
        println!("interpreter: {pin}");
        println!("environment_key: {}", prepared.environment_key(pin));
    }
}

fn batch_report_to_json(report: &BatchReport) -> Value {
    json!({
        "batch_id": report.batch_id,
        "batch_dir": report.batch_dir.display().to_string(),
        "environment": report.manifest_hash,
        "cache_hit": report.cache_hit,
        "succeeded": report.succeeded(),
        "failed": report.failed(),
        "not_started": report.not_started,
        "interrupted": report.interrupted,
        "runs": report.results,
    })
}

fn print_batch_report(report: &BatchReport) {
    println!("batch_dir: {}", report.batch_dir.display());
    println!(
        "environment: {} ({})",
        &report.manifest_hash[..report.manifest_hash.len().min(16)],
        if report.cache_hit { "cached" } else { "built" }
    );
    for result in &report.results {
        let status = match &result.failure {
            None => "ok".to_string(),
            Some(failure) => failure.to_string(),
        };
        println!(
            "  run {:04}  {}  {}",
            result.batch_index,
            status,
            result.run_dir.display()
        );
    }
    if !report.not_started.is_empty() {
        println!("not started: {:?}", report.not_started);
    }
    println!(
        "summary: {} succeeded / {} failed{}",
        report.succeeded(),
        report.failed(),
        if report.interrupted { " (interrupted)" } else { "" }
    );
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::InitConfig { json, .. }
        | Commands::CacheList { json }
        | Commands::CacheClear { json, .. }
        | Commands::Stop { json, .. } => *json,
    }
}
