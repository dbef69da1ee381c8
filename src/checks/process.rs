//! Subprocess execution backend.
//!
//! Commands run under `<shell> -c` on a fixed pool of worker threads fed by a
//! bounded crossbeam channel. Each child gets its own process group so a
//! timeout can kill the plugin together with anything it forked. Timeouts
//! are reported as ordinary completions with [`ExecutionStatus::Timeout`].

#![allow(missing_docs)]

use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

use crate::checks::command::Macros;
use crate::checks::execution::{
    CommandBackend, CommandId, CompletionSink, ExecutionResult, ExecutionStatus,
};
use crate::core::clock::Timeval;
use crate::core::errors::{Result, VigilError};
use crate::objects::STATE_UNKNOWN;

const JOB_QUEUE_CAP: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Plugin output beyond this is cut off.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

struct Job {
    id: CommandId,
    command_line: String,
    env: Vec<(String, String)>,
    timeout: Duration,
    sink: Arc<dyn CompletionSink>,
}

pub struct ProcessBackend {
    shell: PathBuf,
    next_id: AtomicU64,
    tx: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ProcessBackend {
    /// Start `workers` execution threads.
    pub fn new(shell: impl Into<PathBuf>, workers: usize) -> Result<Self> {
        let shell = shell.into();
        let (tx, rx) = bounded::<Job>(JOB_QUEUE_CAP);
        let mut joins = Vec::with_capacity(workers.max(1));
        for n in 0..workers.max(1) {
            let rx = rx.clone();
            let shell = shell.clone();
            let join = thread::Builder::new()
                .name(format!("vigil-exec-{n}"))
                .spawn(move || worker_main(&rx, &shell))
                .map_err(|source| VigilError::Runtime {
                    details: format!("failed to spawn execution worker: {source}"),
                })?;
            joins.push(join);
        }
        Ok(Self {
            shell,
            next_id: AtomicU64::new(1),
            tx: Some(tx),
            workers: joins,
        })
    }

    fn allocate_id(&self) -> CommandId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stop accepting work and wait for in-flight commands to finish.
    pub fn shutdown(&mut self) {
        self.tx = None;
        for join in self.workers.drain(..) {
            if join.join().is_err() {
                eprintln!("[VGL-CHECKER] execution worker panicked");
            }
        }
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CommandBackend for ProcessBackend {
    fn run_async(
        &self,
        processed: &str,
        macros: &Macros,
        timeout: Duration,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<CommandId> {
        let Some(tx) = &self.tx else {
            return Err(VigilError::ChannelClosed {
                component: "execution",
            });
        };
        let id = self.allocate_id();
        let job = Job {
            id,
            command_line: processed.to_string(),
            env: environment(macros),
            timeout,
            sink,
        };
        match tx.try_send(job) {
            Ok(()) => Ok(id),
            Err(TrySendError::Full(_)) => Err(VigilError::Execution {
                command: processed.to_string(),
                details: "execution queue is full".to_string(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(VigilError::ChannelClosed {
                component: "execution",
            }),
        }
    }

    fn run_sync(&self, processed: &str, macros: &Macros, timeout: Duration) -> Result<ExecutionResult> {
        let id = self.allocate_id();
        execute(&self.shell, id, processed, &environment(macros), timeout)
    }
}

/// Macros exported as `VIGIL_<NAME>` variables.
fn environment(macros: &Macros) -> Vec<(String, String)> {
    macros
        .iter()
        .map(|(name, value)| (format!("VIGIL_{name}"), value.to_string()))
        .collect()
}

fn worker_main(rx: &Receiver<Job>, shell: &Path) {
    while let Ok(job) = rx.recv() {
        let result = match execute(shell, job.id, &job.command_line, &job.env, job.timeout) {
            Ok(result) => result,
            Err(err) => {
                let now = Timeval::now();
                ExecutionResult {
                    command_id: job.id,
                    start_time: now,
                    end_time: now,
                    exit_code: STATE_UNKNOWN,
                    status: ExecutionStatus::Crash,
                    output: err.to_string(),
                }
            }
        };
        job.sink.finished(result);
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    thread::Builder::new()
        .name("vigil-exec-pipe".to_string())
        .spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
        .ok()
}

fn collect(reader: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    let mut bytes = reader.and_then(|r| r.join().ok()).unwrap_or_default();
    bytes.truncate(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes).into_owned()
}

fn kill_group(child: &Child) {
    if let Ok(pid) = i32::try_from(child.id()) {
        // The group may already be gone.
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

/// Run one command to completion or timeout.
fn execute(
    shell: &Path,
    id: CommandId,
    command_line: &str,
    env: &[(String, String)],
    timeout: Duration,
) -> Result<ExecutionResult> {
    let start_time = Timeval::now();
    let started = Instant::now();
    let mut child = Command::new(shell)
        .arg("-c")
        .arg(command_line)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::Interrupted {
                VigilError::Interrupted {
                    command: command_line.to_string(),
                }
            } else {
                VigilError::Execution {
                    command: command_line.to_string(),
                    details: source.to_string(),
                }
            }
        })?;

    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if started.elapsed() >= timeout => {
                timed_out = true;
                kill_group(&child);
                break child.wait().ok();
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                eprintln!("[VGL-CHECKER] wait on command {id} failed: {err}");
                kill_group(&child);
                break None;
            }
        }
    };

    let stdout = collect(stdout);
    let stderr = collect(stderr);
    let end_time = Timeval::now();

    let (status, exit_code) = match status {
        _ if timed_out => (ExecutionStatus::Timeout, STATE_UNKNOWN),
        Some(st) => match st.code() {
            Some(code) => (ExecutionStatus::Normal, code),
            None => {
                let signal = st.signal().unwrap_or_default();
                eprintln!("[VGL-CHECKER] command {id} killed by signal {signal}");
                (ExecutionStatus::Crash, STATE_UNKNOWN)
            }
        },
        None => (ExecutionStatus::Crash, STATE_UNKNOWN),
    };
    let output = if status == ExecutionStatus::Normal {
        stdout
    } else {
        stderr
    };

    Ok(ExecutionResult {
        command_id: id,
        start_time,
        end_time,
        exit_code,
        status,
        output,
    })
}
