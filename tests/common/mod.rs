#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use vigil::checks::command::{Command as CheckCommand, CommandRegistry, Macros};
use vigil::checks::execution::{
    CommandBackend, CommandId, CompletionSink, ExecutionResult, ExecutionStatus,
};
use vigil::core::clock::Timeval;
use vigil::core::config::{HostDefinition, ServiceDefinition};
use vigil::core::errors::Result;
use vigil::objects::registry::ObjectStore;

// ──────────────────── recording backend ────────────────────

/// Backend that records every submission. Async runs never complete on
/// their own; tests deliver completions through the checker.
#[derive(Default)]
pub struct RecordingBackend {
    pub submitted: Mutex<Vec<String>>,
    pub sync_calls: AtomicU64,
    next: AtomicU64,
}

impl RecordingBackend {
    pub fn submissions(&self) -> usize {
        self.submitted.lock().len()
    }
}

impl CommandBackend for RecordingBackend {
    fn run_async(
        &self,
        processed: &str,
        _macros: &Macros,
        _timeout: Duration,
        _sink: Arc<dyn CompletionSink>,
    ) -> Result<CommandId> {
        self.submitted.lock().push(processed.to_string());
        Ok(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn run_sync(&self, processed: &str, _macros: &Macros, _timeout: Duration) -> Result<ExecutionResult> {
        self.submitted.lock().push(processed.to_string());
        self.sync_calls.fetch_add(1, Ordering::Relaxed);
        Ok(ExecutionResult {
            command_id: 0,
            start_time: Timeval::from_secs(1_000),
            end_time: Timeval::from_secs(1_001),
            exit_code: 0,
            status: ExecutionStatus::Normal,
            output: "PING OK - rta 0.2ms".to_string(),
        })
    }
}

// ──────────────────── fixtures ────────────────────

/// One host `web1` with a ping check and one `HTTP` service on it.
pub fn web_store() -> Arc<ObjectStore> {
    let store = Arc::new(ObjectStore::new(60, false));
    store
        .add_host(&HostDefinition {
            name: "web1".to_string(),
            address: "10.0.0.1".to_string(),
            check_command: Some("check_ping!100".to_string()),
            ..HostDefinition::default()
        })
        .expect("add host");
    store
        .add_service(&ServiceDefinition {
            host_name: "web1".to_string(),
            description: "HTTP".to_string(),
            check_command: Some("check_http".to_string()),
            ..ServiceDefinition::default()
        })
        .expect("add service");
    store
}

pub fn web_commands() -> Arc<CommandRegistry> {
    let mut commands = CommandRegistry::new();
    commands.insert(CheckCommand::new("check_ping", "ping -w $ARG1$ $HOSTADDRESS$").expect("ping"));
    commands.insert(CheckCommand::new("check_http", "http $HOSTADDRESS$").expect("http"));
    Arc::new(commands)
}

/// Write a spool file and, when asked, its `.ok` sentinel.
pub fn write_spool(dir: &Path, name: &str, body: &str, ready: bool) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write spool file");
    if ready {
        fs::write(dir.join(format!("{name}.ok")), "").expect("write sentinel");
    }
    path
}

// ──────────────────── CLI runner ────────────────────

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_vigil") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "vigil.exe" } else { "vigil" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve vigil binary path for integration test"),
    }
}

/// Run the CLI and keep a transcript under the temp dir for failed runs.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("vigil-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env_remove("VIGIL_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute vigil command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let log_content = format!(
        "case={case_name}\nbinary={}\nargs={args:?}\nstatus={}\n\n[stdout]\n{stdout}\n\n[stderr]\n{stderr}\n",
        bin_path.display(),
        output.status
    );
    fs::write(&log_path, log_content).expect("write test case log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
