//! Execution backend seam: how processed command lines get run.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::checks::command::Macros;
use crate::core::clock::Timeval;
use crate::core::errors::Result;

/// Id handed out by a backend for one asynchronous execution.
pub type CommandId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Process exited on its own.
    Normal,
    /// Killed after exceeding its timeout.
    Timeout,
    /// Killed by a signal or could not be waited on.
    Crash,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub command_id: CommandId,
    pub start_time: Timeval,
    pub end_time: Timeval,
    pub exit_code: i32,
    pub status: ExecutionStatus,
    /// stdout for normal exits, stderr otherwise.
    pub output: String,
}

impl ExecutionResult {
    #[must_use]
    pub fn executed_normally(&self) -> bool {
        self.status == ExecutionStatus::Normal
    }
}

/// Receives asynchronous completions. Called from backend threads.
pub trait CompletionSink: Send + Sync {
    fn finished(&self, result: ExecutionResult);
}

pub trait CommandBackend: Send + Sync {
    /// Start `processed` and return immediately. The completion is delivered
    /// to `sink` exactly once, including on timeout.
    ///
    /// # Errors
    /// `Interrupted` when submission was interrupted and may be retried;
    /// `Execution` for any other launch failure.
    fn run_async(
        &self,
        processed: &str,
        macros: &Macros,
        timeout: Duration,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<CommandId>;

    /// Run `processed` and block until it exits or times out.
    ///
    /// # Errors
    /// `Execution` when the process cannot be started.
    fn run_sync(&self, processed: &str, macros: &Macros, timeout: Duration) -> Result<ExecutionResult>;
}
