//! Check result spool directory.
//!
//! Producers drop one `cXXXXXX` file per batch of results and then create an
//! empty `cXXXXXX.ok` next to it. A file is only read once its `.ok`
//! sentinel exists, and both are deleted after reading, stale or not.
//!
//! The body is `key=value` lines; a blank line ends a record and `#` starts
//! a comment. `file_time` is the producer's write time and marks the whole
//! file stale when it is older than the configured maximum age.

#![allow(missing_docs)]

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use memchr::memchr_iter;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;

use crate::checks::check_result::{CheckOptions, CheckResult, CheckSource, CheckType};
use crate::core::clock::{self, Timestamp, Timeval};
use crate::core::errors::{Result, VigilError};
use crate::objects::{HostId, ObjectRegistry};

const SENTINEL_SUFFIX: &str = ".ok";
const CREATE_ATTEMPTS: usize = 16;

/// One record as read from a spool file, before it is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedResult {
    pub host_name: String,
    pub service_description: Option<String>,
    pub result: CheckResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedFile {
    /// Complete records in file order.
    pub records: Vec<QueuedResult>,
    /// Records dropped because the host or output was missing.
    pub incomplete: usize,
    pub file_time: Option<Timestamp>,
    /// Age in seconds when `file_time` was too old; parsing stopped there.
    pub stale_age: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Processed { results: usize },
    Stale { age_secs: u64 },
}

#[derive(Debug, Default)]
pub struct QueueScan {
    pub processed: Vec<(PathBuf, usize)>,
    pub stale: Vec<(PathBuf, u64)>,
    /// Error that ended the pass early.
    pub error: Option<VigilError>,
}

// ──────────────────── parsing ────────────────────

#[derive(Default)]
struct RecordBuilder {
    host_name: String,
    service_description: Option<String>,
    result: CheckResult,
}

impl RecordBuilder {
    fn set(&mut self, key: &str, value: &str) {
        let r = &mut self.result;
        match key {
            "host_name" => self.host_name = value.to_string(),
            "service_description" => {
                self.service_description = Some(value.to_string());
                r.object_check_type = CheckSource::Service;
            }
            "check_type" => r.check_type = CheckType::from_code(int(value)),
            "check_options" => {
                r.check_options = CheckOptions::from_bits(u32::try_from(int(value)).unwrap_or(0));
            }
            "reschedule_check" => r.reschedule_check = int(value) != 0,
            "latency" => r.latency = value.trim().parse().unwrap_or(0.0),
            "start_time" => r.start_time = Timeval::parse(value).unwrap_or_default(),
            "finish_time" => r.finish_time = Timeval::parse(value).unwrap_or_default(),
            "early_timeout" => r.early_timeout = int(value) != 0,
            "exited_ok" => r.exited_ok = int(value) != 0,
            "return_code" => r.return_code = i32::try_from(int(value)).unwrap_or(0),
            "output" => r.output = value.to_string(),
            _ => {}
        }
    }

    /// Resolve names to ids and hand back a complete record, if it is one.
    fn finish(self, registry: &dyn ObjectRegistry) -> Option<QueuedResult> {
        let mut result = self.result;
        result.host_id = registry
            .find_host_id(&self.host_name)
            .unwrap_or(HostId::NONE);
        if let Some(description) = &self.service_description {
            result.service_id = registry.find_service_id(result.host_id, description);
        }
        result.is_complete().then(|| QueuedResult {
            host_name: self.host_name,
            service_description: self.service_description,
            result,
        })
    }

    fn is_empty(&self) -> bool {
        self.host_name.is_empty()
            && self.service_description.is_none()
            && self.result == CheckResult::default()
    }
}

fn int(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

/// Parse a spool file body.
///
/// A record that is incomplete at its terminating blank line is discarded
/// and the builder reset; the lines that follow start a fresh record.
pub fn parse_check_result_data(
    data: &[u8],
    registry: &dyn ObjectRegistry,
    max_age: Duration,
    now: Timestamp,
) -> ParsedFile {
    let mut parsed = ParsedFile::default();
    let mut builder = RecordBuilder::default();
    let flush = |builder: &mut RecordBuilder, parsed: &mut ParsedFile| {
        let done = std::mem::take(builder);
        if done.is_empty() {
            return;
        }
        match done.finish(registry) {
            Some(record) => parsed.records.push(record),
            None => parsed.incomplete += 1,
        }
    };

    let mut start = 0;
    let ends = memchr_iter(b'\n', data).chain(std::iter::once(data.len()));
    for end in ends {
        if start > data.len() {
            break;
        }
        let raw = &data[start..end];
        start = end + 1;
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');

        if line.is_empty() {
            flush(&mut builder, &mut parsed);
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key == "file_time" {
            let file_time = int(value);
            parsed.file_time = Some(file_time);
            let age = now.saturating_sub(file_time);
            if age > i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX) {
                parsed.stale_age = Some(age.unsigned_abs());
                parsed.records.clear();
                return parsed;
            }
            continue;
        }
        builder.set(key, value);
    }
    flush(&mut builder, &mut parsed);
    parsed
}

/// Read and parse a spool file without consuming it.
pub fn read_check_result_file(
    path: &Path,
    registry: &dyn ObjectRegistry,
    max_age: Duration,
) -> Result<ParsedFile> {
    let data = fs::read(path).map_err(|source| VigilError::io(path, source))?;
    Ok(parse_check_result_data(&data, registry, max_age, clock::now()))
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != ErrorKind::NotFound
    {
        eprintln!("[VGL-REAPER] could not remove {}: {err}", path.display());
    }
}

fn sentinel_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(SENTINEL_SUFFIX);
    PathBuf::from(name)
}

/// Consume one spool file: parse it, submit its complete records unless
/// it is stale, then delete it and its sentinel.
///
/// An empty or unreadable file is deleted and reported as an error.
pub fn process_check_result_file(
    path: &Path,
    registry: &dyn ObjectRegistry,
    max_age: Duration,
    submit: &mut dyn FnMut(CheckResult),
) -> Result<FileOutcome> {
    let data = match fs::read(path) {
        Ok(data) if !data.is_empty() => data,
        Ok(_) => {
            remove_quietly(path);
            return Err(VigilError::ResultFile {
                path: path.to_path_buf(),
                details: "file is empty".to_string(),
            });
        }
        Err(source) => {
            remove_quietly(path);
            return Err(VigilError::io(path, source));
        }
    };

    let parsed = parse_check_result_data(&data, registry, max_age, clock::now());
    remove_quietly(path);
    remove_quietly(&sentinel_for(path));

    if let Some(age_secs) = parsed.stale_age {
        return Ok(FileOutcome::Stale { age_secs });
    }
    let results = parsed.records.len();
    for record in parsed.records {
        submit(record.result);
    }
    Ok(FileOutcome::Processed { results })
}

/// Names producers use: `c` plus six characters.
fn is_spool_name(name: &str) -> bool {
    name.len() == 7 && name.starts_with('c')
}

/// Spool files in `dir` whose sentinel exists, in name order.
pub fn ready_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|source| VigilError::io(dir, source))?;
    let mut ready = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| VigilError::io(dir, source))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_spool_name(name) {
            continue;
        }
        let path = entry.path();
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_file() => {}
            _ => continue,
        }
        if sentinel_for(&path).exists() {
            ready.push(path);
        }
    }
    ready.sort();
    Ok(ready)
}

/// Process every ready spool file in `dir`.
///
/// # Errors
/// Only when the directory itself cannot be read. A file that fails to
/// process ends the pass and is reported in [`QueueScan::error`].
pub fn process_check_result_queue(
    dir: &Path,
    max_age: Duration,
    registry: &dyn ObjectRegistry,
    submit: &mut dyn FnMut(CheckResult),
) -> Result<QueueScan> {
    let mut scan = QueueScan::default();
    for path in ready_files(dir)? {
        match process_check_result_file(&path, registry, max_age, submit) {
            Ok(FileOutcome::Processed { results }) => scan.processed.push((path, results)),
            Ok(FileOutcome::Stale { age_secs }) => {
                eprintln!(
                    "[VGL-REAPER] skipping stale check result file {} ({age_secs}s old)",
                    path.display()
                );
                scan.stale.push((path, age_secs));
            }
            Err(err) => {
                scan.error = Some(err);
                break;
            }
        }
    }
    Ok(scan)
}

// ──────────────────── producing ────────────────────

fn render(result: &CheckResult, host_name: &str, service_description: Option<&str>) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(out, "### Passive check result ###");
    let _ = writeln!(out, "file_time={}", clock::now());
    out.push('\n');
    let _ = writeln!(out, "host_name={host_name}");
    if let Some(description) = service_description {
        let _ = writeln!(out, "service_description={description}");
    }
    let _ = writeln!(out, "check_type={}", result.check_type.code());
    let _ = writeln!(out, "check_options={}", result.check_options.bits());
    let _ = writeln!(out, "reschedule_check={}", u8::from(result.reschedule_check));
    let _ = writeln!(out, "latency={:.3}", result.latency);
    let _ = writeln!(out, "start_time={}", result.start_time);
    let _ = writeln!(out, "finish_time={}", result.finish_time);
    let _ = writeln!(out, "early_timeout={}", u8::from(result.early_timeout));
    let _ = writeln!(out, "exited_ok={}", u8::from(result.exited_ok));
    let _ = writeln!(out, "return_code={}", result.return_code);
    let _ = writeln!(out, "output={}", result.output.replace('\n', "\\n"));
    out.push('\n');
    out
}

/// Write `result` into the spool directory and mark it ready.
pub fn write_check_result_file(
    dir: &Path,
    result: &CheckResult,
    host_name: &str,
    service_description: Option<&str>,
) -> Result<PathBuf> {
    let body = render(result, host_name, service_description);
    let mut rng = rand::rng();
    for _ in 0..CREATE_ATTEMPTS {
        let suffix: String = (&mut rng)
            .sample_iter(Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let path = dir.join(format!("c{suffix}"));
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(VigilError::io(&path, source)),
        };
        file.write_all(body.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|source| VigilError::io(&path, source))?;
        let sentinel = sentinel_for(&path);
        fs::File::create(&sentinel).map_err(|source| VigilError::io(&sentinel, source))?;
        return Ok(path);
    }
    Err(VigilError::ResultFile {
        path: dir.to_path_buf(),
        details: "could not pick an unused file name".to_string(),
    })
}
