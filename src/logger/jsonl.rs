//! Append-only JSONL activity records.
//!
//! Every record is serialized in full before it is written, so a reader
//! tailing the file never sees half a line. When the primary file cannot be
//! written the writer moves down a chain and stays there until
//! [`JsonlWriter::try_recover`] succeeds:
//!
//! primary file -> fallback file -> stderr (`[VGL-JSONL]` prefix) -> discard

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, VigilError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Record kinds written to the activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EngineStart,
    EngineStop,
    ConfigReload,
    CheckDispatch,
    CheckLaunchFailed,
    CheckResultApplied,
    CheckResultDropped,
    ReaperPass,
    ResultFileProcessed,
    ResultFileStale,
    SchedulingAdjusted,
    TimeChange,
    Error,
}

/// One JSONL line. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC, millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// `host#N` / `service#N`, or an object name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    #[must_use]
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event,
            severity,
            object: None,
            command: None,
            command_id: None,
            return_code: None,
            latency: None,
            duration_ms: None,
            count: None,
            path: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would exceed this size.
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval: Duration,
}

impl JsonlConfig {
    /// Defaults around a primary path.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_path: Some(std::env::temp_dir().join("vigil-activity.jsonl")),
            max_size_bytes: 64 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval: Duration::from_secs(10),
        }
    }
}

enum Sink {
    Primary(BufWriter<File>),
    Fallback(BufWriter<File>),
    Stderr,
    Discard,
}

impl Sink {
    fn file(&mut self) -> Option<&mut BufWriter<File>> {
        match self {
            Self::Primary(w) | Self::Fallback(w) => Some(w),
            Self::Stderr | Self::Discard => None,
        }
    }
}

pub struct JsonlWriter {
    config: JsonlConfig,
    sink: Sink,
    size: u64,
    last_sync: Instant,
}

impl JsonlWriter {
    /// Open the primary file, falling back down the chain if needed.
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            sink: Sink::Discard,
            size: 0,
            last_sync: Instant::now(),
        };
        writer.open_primary();
        writer
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(mut line) => {
                line.push('\n');
                self.write_line(&line);
            }
            Err(e) => eprintln!("[VGL-JSONL] cannot serialize {:?}: {e}", entry.event),
        }
    }

    pub fn flush(&mut self) {
        if let Some(w) = self.sink.file() {
            let _ = w.flush();
        }
    }

    pub fn fsync(&mut self) {
        if let Some(w) = self.sink.file() {
            let _ = w.flush();
            let _ = w.get_ref().sync_data();
        }
        self.last_sync = Instant::now();
    }

    #[must_use]
    pub const fn state(&self) -> &'static str {
        match self.sink {
            Sink::Primary(_) => "primary",
            Sink::Fallback(_) => "fallback",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    /// Return to the primary file if it has become writable again.
    pub fn try_recover(&mut self) {
        if matches!(self.sink, Sink::Primary(_)) {
            return;
        }
        if let Ok((file, size)) = open_append(&self.config.path) {
            eprintln!(
                "[VGL-JSONL] activity log back on {}",
                self.config.path.display()
            );
            self.sink = Sink::Primary(BufWriter::new(file));
            self.size = size;
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.size + len > self.config.max_size_bytes && self.sink.file().is_some() {
            self.rotate();
        }
        loop {
            match &mut self.sink {
                Sink::Primary(w) | Sink::Fallback(w) => {
                    if w.write_all(line.as_bytes()).is_ok() {
                        self.size += len;
                        if self.last_sync.elapsed() >= self.config.fsync_interval {
                            self.fsync();
                        }
                        return;
                    }
                    self.degrade();
                }
                Sink::Stderr => {
                    let _ = write!(io::stderr(), "[VGL-JSONL] {line}");
                    return;
                }
                Sink::Discard => return,
            }
        }
    }

    fn open_primary(&mut self) {
        match open_append(&self.config.path) {
            Ok((file, size)) => {
                self.sink = Sink::Primary(BufWriter::new(file));
                self.size = size;
            }
            Err(e) => {
                eprintln!("[VGL-JSONL] {e}");
                self.open_fallback();
            }
        }
    }

    fn open_fallback(&mut self) {
        let opened = self
            .config
            .fallback_path
            .as_deref()
            .map(|p| (p, open_append(p)));
        match opened {
            Some((path, Ok((file, size)))) => {
                eprintln!("[VGL-JSONL] writing activity to fallback {}", path.display());
                self.sink = Sink::Fallback(BufWriter::new(file));
                self.size = size;
            }
            _ => {
                eprintln!("[VGL-JSONL] no writable activity log, using stderr");
                self.sink = Sink::Stderr;
            }
        }
    }

    fn degrade(&mut self) {
        match std::mem::replace(&mut self.sink, Sink::Discard) {
            Sink::Primary(_) => self.open_fallback(),
            Sink::Fallback(_) => self.sink = Sink::Stderr,
            Sink::Stderr | Sink::Discard => {}
        }
    }

    fn rotate(&mut self) {
        let base = match &self.sink {
            Sink::Primary(_) => self.config.path.clone(),
            Sink::Fallback(_) => match &self.config.fallback_path {
                Some(p) => p.clone(),
                None => return,
            },
            Sink::Stderr | Sink::Discard => return,
        };
        self.flush();
        let keep = self.config.max_rotated_files.max(1);
        let _ = fs::remove_file(rotated_name(&base, keep));
        for i in (1..keep).rev() {
            let _ = fs::rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        let _ = fs::rename(&base, rotated_name(&base, 1));

        match open_append(&base) {
            Ok((file, _)) => {
                let w = BufWriter::new(file);
                self.sink = match self.sink {
                    Sink::Fallback(_) => Sink::Fallback(w),
                    _ => Sink::Primary(w),
                };
                self.size = 0;
            }
            Err(_) => self.degrade(),
        }
    }
}

fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| VigilError::io(parent, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| VigilError::io(path, e))?;
    let size = file.metadata().map_or(0, |m| m.len());
    Ok((file, size))
}

/// `activity.jsonl` -> `activity.jsonl.2`
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}
