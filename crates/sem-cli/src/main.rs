use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use sem_core::{BuildMode, CampaignSpec, ParamFilter, ParamValue, RunnerKind, SemError};
use sem_runner::{CampaignManager, ExecutionEnvironment, FailedRunPolicy, ManagerConfig};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "sem=info";

#[derive(Parser)]
#[command(name = "sem", version, about = "Simulation campaign manager")]
struct Cli {
    /// Log at debug level unless SEM_LOG or RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RunnerArg {
    Local,
    Grid,
    /// Grid when a batch queue is reachable, local otherwise.
    Auto,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FailedArg {
    Skip,
    Retry,
}

impl From<FailedArg> for FailedRunPolicy {
    fn from(value: FailedArg) -> Self {
        match value {
            FailedArg::Skip => FailedRunPolicy::Skip,
            FailedArg::Retry => FailedRunPolicy::Retry,
        }
    }
}

#[derive(Args, Clone, Debug)]
struct CampaignArgs {
    /// Results directory holding the campaign.
    #[arg(long, short = 'r')]
    results: PathBuf,
    /// YAML manager configuration; flags take precedence.
    #[arg(long, env = "SEM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args, Clone, Debug, Default)]
struct ExecutionArgs {
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long, value_enum)]
    failed: Option<FailedArg>,
    #[arg(long)]
    max_failures: Option<usize>,
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a campaign, or reopen an identical one.
    New {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[arg(long, short = 'e')]
        executable: PathBuf,
        /// `name` or `name=default`; repeat for every parameter.
        #[arg(long = "param", short = 'p', required = true)]
        params: Vec<String>,
        #[arg(long, value_enum, default_value = "auto")]
        runner: RunnerArg,
        #[arg(long)]
        debug_build: bool,
        #[arg(long)]
        repetition_arg: Option<String>,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        json: bool,
    },
    /// Dispatch every missing run of the requested space.
    Run {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[command(flatten)]
        execution: ExecutionArgs,
        /// `name=v1,v2` or `name=[v1, v2]`; unlisted parameters use their default.
        #[arg(long = "set", short = 's')]
        set_values: Vec<String>,
        #[arg(long, short = 'n', default_value_t = 1)]
        runs: u32,
        /// Run the campaign against an executable at a different path.
        #[arg(long)]
        executable: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List the runs `run` would dispatch.
    Missing {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[arg(long, value_enum)]
        failed: Option<FailedArg>,
        #[arg(long = "set", short = 's')]
        set_values: Vec<String>,
        #[arg(long, short = 'n', default_value_t = 1)]
        runs: u32,
        #[arg(long)]
        json: bool,
    },
    /// Show complete results matching a filter.
    View {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[arg(long = "set", short = 's')]
        set_values: Vec<String>,
        /// Include captured stdout/stderr.
        #[arg(long)]
        outputs: bool,
        #[arg(long)]
        json: bool,
    },
    /// Describe the campaign and count its runs.
    Info {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[arg(long)]
        json: bool,
    },
    /// Forget FAILED runs so the next `run` dispatches them again.
    ClearFailed {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[arg(long = "set", short = 's')]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<SemError>()
                    .map(SemError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "sem=debug" } else { DEFAULT_LOG_FILTER };
    let filter = ["SEM_LOG", "RUST_LOG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find_map(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::New {
            campaign,
            executable,
            params,
            runner,
            debug_build,
            repetition_arg,
            overwrite,
            json,
        } => {
            let config = load_config(campaign.config.as_deref())?;
            let runner = match runner {
                RunnerArg::Local => RunnerKind::Local,
                RunnerArg::Grid => RunnerKind::Grid,
                RunnerArg::Auto => ExecutionEnvironment::detect(&config.grid).preferred_runner(),
            };
            let mut spec = CampaignSpec::new(executable).runner(runner);
            if debug_build {
                spec = spec.build_mode(BuildMode::Debug);
            }
            if let Some(name) = repetition_arg {
                spec.repetition_argument = name;
            }
            for raw in &params {
                let (name, default) = parse_param_declaration(raw)?;
                spec = spec.param(name, default);
            }
            let mgr = CampaignManager::new(&campaign.results, &spec, overwrite, config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "new",
                    "results_dir": campaign.results.display().to_string(),
                    "campaign": mgr.campaign(),
                })));
            }
            print!("{}", mgr.campaign());
            println!("results_dir: {}", campaign.results.display());
        }
        Commands::Run {
            campaign,
            execution,
            set_values,
            runs,
            executable,
            json,
        } => {
            let mut config = load_config(campaign.config.as_deref())?;
            apply_execution_flags(&mut config, &execution);
            let mgr = match &executable {
                Some(exe) => CampaignManager::load_with_executable(&campaign.results, exe, config)?,
                None => CampaignManager::load(&campaign.results, config)?,
            };
            let filter = parse_set_bindings(&set_values)?;
            let summary = mgr.run_missing(&filter, runs)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary,
                })));
            }
            println!("{}", summary);
        }
        Commands::Missing {
            campaign,
            failed,
            set_values,
            runs,
            json,
        } => {
            let mut config = load_config(campaign.config.as_deref())?;
            if let Some(policy) = failed {
                config.failed_runs = policy.into();
            }
            let mgr = CampaignManager::load(&campaign.results, config)?;
            let filter = parse_set_bindings(&set_values)?;
            let jobs = mgr.missing_runs(&filter, runs)?;
            if json {
                let jobs: Vec<Value> = jobs
                    .iter()
                    .map(|job| {
                        json!({
                            "run_key": job.run_key,
                            "params": job.combination,
                            "repetition": job.repetition,
                            "attempt": job.attempt,
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "missing",
                    "count": jobs.len(),
                    "jobs": jobs,
                })));
            }
            for job in &jobs {
                println!("{} {} repetition={}", job.run_key, job.combination, job.repetition);
            }
            println!("missing: {}", jobs.len());
        }
        Commands::View {
            campaign,
            set_values,
            outputs,
            json,
        } => {
            let config = load_config(campaign.config.as_deref())?;
            let mgr = CampaignManager::load(&campaign.results, config)?;
            let filter = parse_set_bindings(&set_values)?;
            let results = mgr.get_complete_results(&filter)?;
            if json {
                let rows: Vec<Value> = results
                    .iter()
                    .map(|r| {
                        let mut row = json!({
                            "record": r.record,
                            "artifacts": r.artifacts,
                        });
                        if outputs {
                            row["stdout"] = json!(r.stdout);
                            row["stderr"] = json!(r.stderr);
                        }
                        row
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "view",
                    "count": rows.len(),
                    "results": rows,
                })));
            }
            for r in &results {
                println!(
                    "{} {} repetition={} elapsed={}",
                    r.record.run_key,
                    r.record.params,
                    r.record.repetition,
                    r.record
                        .elapsed_secs()
                        .map(|s| format!("{:.3}s", s))
                        .unwrap_or_else(|| "-".to_string())
                );
                for (name, path) in &r.artifacts {
                    println!("  {} -> {}", name, path.display());
                }
                if outputs {
                    print_stream("stdout", &r.stdout);
                    print_stream("stderr", &r.stderr);
                }
            }
            println!("results: {}", results.len());
        }
        Commands::Info { campaign, json } => {
            let config = load_config(campaign.config.as_deref())?;
            let store = sem_store::ResultStore::open(&campaign.results);
            if json {
                let doc = store.read_campaign()?;
                let counts = store.state_counts()?;
                return Ok(Some(json!({
                    "ok": true,
                    "command": "info",
                    "campaign": doc,
                    "runs": counts,
                    "grid_available": ExecutionEnvironment::detect(&config.grid).grid_available,
                })));
            }
            let mgr = CampaignManager::load(&campaign.results, config)?;
            print!("{}", mgr.describe()?);
        }
        Commands::ClearFailed {
            campaign,
            set_values,
            json,
        } => {
            let config = load_config(campaign.config.as_deref())?;
            let mgr = CampaignManager::load(&campaign.results, config)?;
            let filter = parse_set_bindings(&set_values)?;
            let cleared = mgr.clear_failed(&filter)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "clear-failed",
                    "cleared": cleared,
                })));
            }
            println!("cleared: {}", cleared);
        }
    }
    Ok(None)
}

fn load_config(path: Option<&Path>) -> Result<ManagerConfig> {
    let config = match path {
        Some(p) => ManagerConfig::from_yaml_file(p)
            .with_context(|| format!("loading config {}", p.display()))?,
        None => ManagerConfig::default(),
    };
    debug!(path = ?path, config = ?config, "manager config");
    Ok(config)
}

fn apply_execution_flags(config: &mut ManagerConfig, flags: &ExecutionArgs) {
    if let Some(n) = flags.concurrency {
        config.concurrency = Some(n.max(1));
    }
    if let Some(policy) = flags.failed {
        config.failed_runs = policy.into();
    }
    if flags.max_failures.is_some() {
        config.max_failures = flags.max_failures;
    }
    if flags.timeout_secs.is_some() {
        config.job_timeout_secs = flags.timeout_secs;
    }
}

fn print_stream(label: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    println!("  --- {} ---", label);
    for line in text.lines() {
        println!("  {}", line);
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
        Commands::New { json, .. }
        | Commands::Run { json, .. }
        | Commands::Missing { json, .. }
        | Commands::View { json, .. }
        | Commands::Info { json, .. }
        | Commands::ClearFailed { json, .. } => *json,
    }
}

/// `nodes` declares a parameter without default, `mode=fast` with one.
fn parse_param_declaration(raw: &str) -> Result<(String, Option<ParamValue>)> {
    let (name, default) = match raw.split_once('=') {
        Some((name, value)) => (name.trim(), Some(ParamValue::parse_literal(value))),
        None => (raw.trim(), None),
    };
    if name.is_empty() {
        return Err(anyhow!("invalid --param '{}': name cannot be empty", raw));
    }
    Ok((name.to_string(), default))
}

fn parse_set_bindings(values: &[String]) -> Result<ParamFilter> {
    let mut filter = ParamFilter::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected name=value[,value...]", raw))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("invalid --set '{}': name cannot be empty", raw));
        }
        filter.insert(key, parse_value_list(val_raw)?);
    }
    Ok(filter)
}

fn parse_value_list(raw: &str) -> Result<Vec<ParamValue>> {
    let trimmed = raw.trim();
    if let Some(inner) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        if let Ok(values) = serde_json::from_str::<Vec<ParamValue>>(trimmed) {
            return Ok(values);
        }
        return Ok(split_literals(inner));
    }
    if trimmed.is_empty() {
        return Err(anyhow!("empty value list"));
    }
    Ok(split_literals(trimmed))
}

fn split_literals(raw: &str) -> Vec<ParamValue> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ParamValue::parse_literal)
        .collect()
}
