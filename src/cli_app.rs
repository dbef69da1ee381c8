//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use vigil::checks::check_result::{CheckResult, CheckSource, CheckType};
use vigil::checks::result_queue::{ParsedFile, read_check_result_file, ready_files, write_check_result_file};
use vigil::core::clock::Timeval;
use vigil::core::config::Config;
use vigil::events::sched_info::SchedulingInfo;
use vigil::objects::registry::ObjectStore;
use vigil::objects::{Checkable, ServiceState};

/// vigil: host and service check scheduler.
#[derive(Debug, Parser)]
#[command(
    name = "vigil",
    author,
    version,
    about = "Host and service check scheduler",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the scheduling engine until stopped.
    Run,
    /// Load and validate the configuration.
    VerifyConfig,
    /// Show projected initial scheduling and tuning hints.
    SchedulingInfo,
    /// Queue a passive check result for the engine to pick up.
    Submit(SubmitArgs),
    /// List ready check-result files without consuming them.
    InspectQueue(QueueArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Serialize)]
struct SubmitArgs {
    /// Host the result belongs to.
    #[arg(long, value_name = "NAME")]
    host: String,
    /// Service description; omit for a host result.
    #[arg(long, value_name = "DESCRIPTION")]
    service: Option<String>,
    /// Plugin return code.
    #[arg(long, default_value_t = 0, value_name = "CODE")]
    return_code: i32,
    /// Plugin output, including optional `|perfdata`.
    #[arg(long, value_name = "TEXT")]
    output: String,
    /// Queue directory (defaults to `reaper.check_result_path`).
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args, Serialize)]
struct QueueArgs {
    /// Queue directory (defaults to `reaper.check_result_path`).
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Target shell.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<vigil::core::errors::VigilError> for CliError {
    fn from(err: vigil::core::errors::VigilError) -> Self {
        match err.code() {
            "VGL-1001" | "VGL-1002" | "VGL-1003" => Self::User(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run => run_engine(cli),
        Command::VerifyConfig => run_verify_config(cli),
        Command::SchedulingInfo => run_scheduling_info(cli),
        Command::Submit(args) => run_submit(cli, args),
        Command::InspectQueue(args) => run_inspect_queue(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

// ──────────────────── run ────────────────────

#[cfg(unix)]
fn run_engine(cli: &Cli) -> Result<(), CliError> {
    use vigil::daemon::loop_main::{Engine, StopReason};
    use vigil::daemon::signals::SignalHandler;
    use vigil::logger::activity::ActivityEvent;

    let signals = SignalHandler::new();
    let mut config = load_config(cli)?;
    let mut reloaded: Option<String> = None;

    loop {
        let mut engine = Engine::init(config.clone(), signals.clone())?;
        if let Some(details) = reloaded.take() {
            engine.log(ActivityEvent::ConfigReloaded { details });
        }
        let reason = engine.run();
        if reason != StopReason::Restart {
            let stats = engine.checker().stats();
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{} {}", "engine stopped:".bold(), reason.label());
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "run",
                        "reason": reason,
                        "stats": stats,
                    }))?;
                }
            }
            return Ok(());
        }

        signals.clear_restart();
        eprintln!("[VGL-CONFIG] restart requested (SIGHUP); reloading configuration");
        match Config::load(cli.config.as_deref()) {
            Ok(next) => {
                let old_hash = config.stable_hash().unwrap_or_default();
                let new_hash = next.stable_hash().unwrap_or_default();
                reloaded = Some(format!("config hash: {old_hash} -> {new_hash}"));
                config = next;
            }
            Err(err) => {
                eprintln!("[VGL-CONFIG] reload failed, keeping previous configuration: {err}");
            }
        }
    }
}

#[cfg(not(unix))]
fn run_engine(_cli: &Cli) -> Result<(), CliError> {
    Err(CliError::User(
        "the engine needs a unix host to run check commands".to_string(),
    ))
}

// ──────────────────── verify-config ────────────────────

fn run_verify_config(cli: &Cli) -> Result<(), CliError> {
    match Config::load(cli.config.as_deref()) {
        Ok(config) => {
            let hash = config.stable_hash()?;
            let objects = &config.objects;
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", "Configuration is valid.".green());
                    println!("  Source:   {}", config.paths.config_file.display());
                    println!("  Hash:     {hash}");
                    println!(
                        "  Objects:  {} commands, {} hosts, {} services",
                        objects.commands.len(),
                        objects.hosts.len(),
                        objects.services.len()
                    );
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "verify-config",
                        "valid": true,
                        "path": config.paths.config_file.to_string_lossy(),
                        "hash": hash,
                        "commands": objects.commands.len(),
                        "hosts": objects.hosts.len(),
                        "services": objects.services.len(),
                    }))?;
                }
            }
            Ok(())
        }
        Err(e) => {
            match output_mode(cli) {
                OutputMode::Human => eprintln!("{} {e}", "Configuration is INVALID:".red()),
                OutputMode::Json => write_json_line(&json!({
                    "command": "verify-config",
                    "valid": false,
                    "code": e.code(),
                    "error": e.to_string(),
                }))?,
            }
            Err(CliError::User(format!("invalid config: {e}")))
        }
    }
}

// ──────────────────── scheduling-info ────────────────────

fn run_scheduling_info(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = ObjectStore::from_config(&config)?;
    let hosts: Vec<Arc<dyn Checkable>> = store
        .hosts()
        .into_iter()
        .map(|h| h as Arc<dyn Checkable>)
        .collect();
    let services: Vec<Arc<dyn Checkable>> = store
        .services()
        .into_iter()
        .map(|s| s as Arc<dyn Checkable>)
        .collect();

    let now = vigil::core::clock::now();
    let mut info = SchedulingInfo::compute(&config.scheduling, &hosts, &services, now);
    info.plan_initial_service_checks(&services, now);
    info.plan_initial_host_checks(&hosts, now);
    let suggestions = info.suggestions(&config);

    match output_mode(cli) {
        OutputMode::Human => {
            print!("{}", info.report(&config));
            println!();
            println!("{}", "PERFORMANCE SUGGESTIONS".bold());
            println!("-----------------------");
            if suggestions.is_empty() {
                println!("I have no suggestions - things look okay.");
            }
            for (n, hint) in suggestions.iter().enumerate() {
                println!("{}. {hint}", n + 1);
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "scheduling-info",
                "info": info,
                "suggestions": suggestions,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── submit ────────────────────

fn queue_dir(explicit: Option<&Path>, config: &Config) -> Result<PathBuf, CliError> {
    explicit
        .or_else(|| config.check_result_path())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            CliError::User(
                "no queue directory: pass --dir or set reaper.check_result_path".to_string(),
            )
        })
}

fn run_submit(cli: &Cli, args: &SubmitArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let dir = queue_dir(args.dir.as_deref(), &config)?;
    if args.output.is_empty() {
        return Err(CliError::User("--output must not be empty".to_string()));
    }

    let now = Timeval::now();
    let result = CheckResult {
        object_check_type: if args.service.is_some() {
            CheckSource::Service
        } else {
            CheckSource::Host
        },
        check_type: CheckType::Passive,
        return_code: args.return_code,
        output: args.output.clone(),
        start_time: now,
        finish_time: now,
        ..CheckResult::default()
    };
    let path = write_check_result_file(&dir, &result, &args.host, args.service.as_deref())?;

    match output_mode(cli) {
        OutputMode::Human => {
            let target = args
                .service
                .as_ref()
                .map_or_else(|| args.host.clone(), |svc| format!("{}/{svc}", args.host));
            println!(
                "{} {target} ({}) -> {}",
                "queued".green(),
                ServiceState::from_return_code(args.return_code).label(),
                path.display()
            );
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "submit",
                "path": path.to_string_lossy(),
                "args": args,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── inspect-queue ────────────────────

#[derive(Debug, Serialize)]
struct InspectedFile {
    path: PathBuf,
    #[serde(flatten)]
    parsed: ParsedFile,
}

fn run_inspect_queue(cli: &Cli, args: &QueueArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let dir = queue_dir(args.dir.as_deref(), &config)?;
    let store = ObjectStore::from_config(&config)?;
    let max_age = config.max_check_result_file_age();

    let mut files = Vec::new();
    for path in ready_files(&dir)? {
        match read_check_result_file(&path, &store, max_age) {
            Ok(parsed) => files.push(InspectedFile { path, parsed }),
            Err(err) => eprintln!("[VGL-REAPER] skipping {}: {err}", path.display()),
        }
    }

    match output_mode(cli) {
        OutputMode::Human => print_queue(&dir, &files),
        OutputMode::Json => {
            let files: Vec<Value> = files
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?;
            write_json_line(&json!({
                "command": "inspect-queue",
                "dir": dir.to_string_lossy(),
                "files": files,
            }))?;
        }
    }
    Ok(())
}

fn print_queue(dir: &Path, files: &[InspectedFile]) {
    println!("{} {}", "Check result queue:".bold(), dir.display());
    if files.is_empty() {
        println!("  (no ready files)");
        return;
    }
    for file in files {
        let name = file
            .path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        if let Some(age) = file.parsed.stale_age {
            println!("  {name}  {} ({age}s old, will be discarded)", "stale".yellow());
            continue;
        }
        println!(
            "  {name}  {} records, {} incomplete",
            file.parsed.records.len(),
            file.parsed.incomplete
        );
        for record in &file.parsed.records {
            let target = record.service_description.as_ref().map_or_else(
                || record.host_name.clone(),
                |svc| format!("{}/{svc}", record.host_name),
            );
            let first_line = record.result.output.lines().next().unwrap_or_default();
            println!("    {target:<32} rc={} {first_line}", record.result.return_code);
        }
    }
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("VIGIL_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
