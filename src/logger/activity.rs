//! Activity logger thread.
//!
//! A dedicated thread owns the [`JsonlWriter`]. Everyone else holds an
//! [`ActivityLoggerHandle`] and sends [`ActivityEvent`]s over a bounded
//! crossbeam channel with `try_send`, so the scheduler never waits on disk.
//! Events that do not fit are counted and reported by the logger thread.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{Result, VigilError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

const CHANNEL_CAPACITY: usize = 1024;

// ──────────────────── events ────────────────────

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    EngineStarted {
        version: String,
        config_hash: String,
        hosts: usize,
        services: usize,
    },
    EngineStopped {
        reason: String,
        uptime_secs: u64,
    },
    ConfigReloaded {
        details: String,
    },
    CheckDispatched {
        object: String,
        command: String,
        command_id: u64,
        latency: f64,
    },
    CheckLaunchFailed {
        object: String,
        command: String,
        error_code: String,
        error_message: String,
    },
    CheckResultApplied {
        object: String,
        return_code: i32,
        execution_ms: u64,
    },
    CheckResultDropped {
        object: String,
        reason: String,
    },
    ReaperPass {
        applied: usize,
        dropped: usize,
        remaining: usize,
        duration_ms: u64,
    },
    ResultFileProcessed {
        path: String,
        results: usize,
    },
    ResultFileStale {
        path: String,
        age_secs: u64,
    },
    SchedulingAdjusted {
        checks: usize,
        window_secs: u64,
    },
    TimeChange {
        backwards: bool,
        difference_secs: u64,
    },
    Error {
        code: String,
        message: String,
    },
    /// Stops the logger thread after flushing.
    Shutdown,
}

// ──────────────────── handle ────────────────────

/// Cloneable sender side. A disabled handle drops everything silently.
#[derive(Clone, Default)]
pub struct ActivityLoggerHandle {
    tx: Option<Sender<ActivityEvent>>,
    dropped: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Handle with no logger behind it.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Non-blocking send; counts the event as dropped when the channel is full.
    pub fn send(&self, event: ActivityEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(TrySendError::Full(_)) = tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Ask the logger thread to flush and exit. Blocks only if the channel is full.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ActivityEvent::Shutdown);
        }
    }
}

// ──────────────────── spawn ────────────────────

pub struct ActivityLoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl ActivityLoggerConfig {
    #[must_use]
    pub fn new(jsonl: JsonlConfig) -> Self {
        Self {
            jsonl,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Start the logger thread.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded(config.channel_capacity.max(1));
    let handle = ActivityLoggerHandle {
        tx: Some(tx),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let dropped = Arc::clone(&handle.dropped);
    let jsonl = config.jsonl;
    let join = thread::Builder::new()
        .name("vigil-logger".to_string())
        .spawn(move || logger_main(&rx, jsonl, &dropped))
        .map_err(|e| VigilError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;
    Ok((handle, join))
}

fn logger_main(rx: &Receiver<ActivityEvent>, jsonl: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(jsonl);
    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.count = Some(lost);
            warn.details = Some(format!("{lost} activity events dropped under back-pressure"));
            writer.write_entry(&warn);
        }
        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        writer.write_entry(&to_entry(&event));
        if writer.state() != "primary" {
            writer.try_recover();
        }
    }
    writer.fsync();
}

// ──────────────────── conversion ────────────────────

#[allow(clippy::too_many_lines)]
fn to_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::EngineStarted {
            version,
            config_hash,
            hosts,
            services,
        } => {
            let mut e = LogEntry::new(EventType::EngineStart, Severity::Info);
            e.details = Some(format!(
                "version={version} config_hash={config_hash} hosts={hosts} services={services}"
            ));
            e.ok = Some(true);
            e
        }
        ActivityEvent::EngineStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::EngineStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::ConfigReloaded { details } => {
            let mut e = LogEntry::new(EventType::ConfigReload, Severity::Info);
            e.details = Some(details.clone());
            e
        }
        ActivityEvent::CheckDispatched {
            object,
            command,
            command_id,
            latency,
        } => {
            let mut e = LogEntry::new(EventType::CheckDispatch, Severity::Info);
            e.object = Some(object.clone());
            e.command = Some(command.clone());
            e.command_id = Some(*command_id);
            e.latency = Some(*latency);
            e
        }
        ActivityEvent::CheckLaunchFailed {
            object,
            command,
            error_code,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::CheckLaunchFailed, Severity::Warning);
            e.object = Some(object.clone());
            e.command = Some(command.clone());
            e.error_code = Some(error_code.clone());
            e.error_message = Some(error_message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::CheckResultApplied {
            object,
            return_code,
            execution_ms,
        } => {
            let mut e = LogEntry::new(EventType::CheckResultApplied, Severity::Info);
            e.object = Some(object.clone());
            e.return_code = Some(*return_code);
            e.duration_ms = Some(*execution_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::CheckResultDropped { object, reason } => {
            let mut e = LogEntry::new(EventType::CheckResultDropped, Severity::Warning);
            e.object = Some(object.clone());
            e.details = Some(reason.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::ReaperPass {
            applied,
            dropped,
            remaining,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::ReaperPass, Severity::Info);
            e.count = Some(*applied as u64);
            e.duration_ms = Some(*duration_ms);
            e.details = Some(format!("dropped={dropped} remaining={remaining}"));
            e
        }
        ActivityEvent::ResultFileProcessed { path, results } => {
            let mut e = LogEntry::new(EventType::ResultFileProcessed, Severity::Info);
            e.path = Some(path.clone());
            e.count = Some(*results as u64);
            e.ok = Some(true);
            e
        }
        ActivityEvent::ResultFileStale { path, age_secs } => {
            let mut e = LogEntry::new(EventType::ResultFileStale, Severity::Warning);
            e.path = Some(path.clone());
            e.details = Some(format!("age={age_secs}s"));
            e.ok = Some(false);
            e
        }
        ActivityEvent::SchedulingAdjusted {
            checks,
            window_secs,
        } => {
            let mut e = LogEntry::new(EventType::SchedulingAdjusted, Severity::Info);
            e.count = Some(*checks as u64);
            e.details = Some(format!("window={window_secs}s"));
            e
        }
        ActivityEvent::TimeChange {
            backwards,
            difference_secs,
        } => {
            let mut e = LogEntry::new(EventType::TimeChange, Severity::Warning);
            let direction = if *backwards { "backwards" } else { "forwards" };
            e.details = Some(format!("{direction} by {difference_secs}s"));
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::EngineStop, Severity::Info),
    }
}
