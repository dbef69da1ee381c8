//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, VigilError};

/// Full engine configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub checks: CheckConfig,
    pub reaper: ReaperConfig,
    pub scheduling: SchedulingConfig,
    pub execution: ExecutionConfig,
    pub paths: PathsConfig,
    pub objects: ObjectsConfig,
}

/// Check execution switches and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckConfig {
    pub host_check_timeout_secs: u64,
    pub service_check_timeout_secs: u64,
    /// Keep WARNING distinct from OK for host checks.
    pub use_aggressive_host_checking: bool,
    pub execute_host_checks: bool,
    pub execute_service_checks: bool,
    /// Zero means unlimited.
    pub max_parallel_service_checks: usize,
    pub cached_host_check_horizon_secs: u64,
}

/// Result reaper cadence and the passive result directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReaperConfig {
    pub check_reaper_interval_secs: u64,
    pub max_check_reaper_time_secs: u64,
    /// Directory scanned for `cXXXXXX` result files; disabled when unset.
    pub check_result_path: Option<PathBuf>,
    pub max_check_result_file_age_secs: u64,
}

/// How the delay between initial checks is derived.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InterCheckDelay {
    /// Every check starts at once.
    None,
    /// One second apart.
    Dumb,
    /// Spread evenly over the average check interval.
    Smart,
    /// Fixed delay in seconds.
    User(f64),
}

/// How service checks of one host are interleaved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterleaveFactor {
    Smart,
    User(u32),
}

/// Initial spreading, auto-rescheduling, and loop timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Seconds per check-interval unit.
    pub interval_length_secs: u64,
    pub host_inter_check_delay: InterCheckDelay,
    pub service_inter_check_delay: InterCheckDelay,
    pub service_interleave_factor: InterleaveFactor,
    pub max_host_check_spread_minutes: u64,
    pub max_service_check_spread_minutes: u64,
    pub auto_reschedule_checks: bool,
    pub auto_rescheduling_interval_secs: u64,
    pub auto_rescheduling_window_secs: u64,
    /// Forward clock jumps at least this large trigger compensation.
    pub time_change_threshold_secs: u64,
    pub sleep_time_ms: u64,
}

/// Process backend sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub worker_threads: usize,
    pub shell: PathBuf,
}

/// Filesystem paths used by vigil.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub activity_log: PathBuf,
}

/// Monitored object definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ObjectsConfig {
    pub commands: Vec<CommandDefinition>,
    pub hosts: Vec<HostDefinition>,
    pub services: Vec<ServiceDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CommandDefinition {
    pub name: String,
    /// Raw command line with `$MACRO$` placeholders.
    pub command_line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostDefinition {
    pub name: String,
    pub address: String,
    /// `command_name!arg1!arg2`; hosts without one are assumed UP.
    pub check_command: Option<String>,
    /// In interval-length units.
    pub check_interval: u64,
    pub retry_interval: u64,
    pub max_check_attempts: u32,
    pub checks_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceDefinition {
    pub host_name: String,
    pub description: String,
    pub check_command: Option<String>,
    pub check_interval: u64,
    pub retry_interval: u64,
    pub max_check_attempts: u32,
    pub checks_enabled: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            host_check_timeout_secs: 30,
            service_check_timeout_secs: 60,
            use_aggressive_host_checking: false,
            execute_host_checks: true,
            execute_service_checks: true,
            max_parallel_service_checks: 0,
            cached_host_check_horizon_secs: 15,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            check_reaper_interval_secs: 10,
            max_check_reaper_time_secs: 30,
            check_result_path: None,
            max_check_result_file_age_secs: 3_600,
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            interval_length_secs: 60,
            host_inter_check_delay: InterCheckDelay::Smart,
            service_inter_check_delay: InterCheckDelay::Smart,
            service_interleave_factor: InterleaveFactor::Smart,
            max_host_check_spread_minutes: 30,
            max_service_check_spread_minutes: 30,
            auto_reschedule_checks: false,
            auto_rescheduling_interval_secs: 30,
            auto_rescheduling_window_secs: 180,
            time_change_threshold_secs: 900,
            sleep_time_ms: 500,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism().map_or(4, |n| n.get().max(2)),
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[VGL-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("vigil").join("config.toml");
        let data = home_dir.join(".local").join("share").join("vigil");
        Self {
            config_file: cfg,
            activity_log: data.join("activity.jsonl"),
        }
    }
}

impl Default for HostDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            check_command: None,
            check_interval: 5,
            retry_interval: 1,
            max_check_attempts: 3,
            checks_enabled: true,
        }
    }
}

impl Default for ServiceDefinition {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            description: String::new(),
            check_command: None,
            check_interval: 5,
            retry_interval: 1,
            max_check_attempts: 3,
            checks_enabled: true,
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| VigilError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(VigilError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a keeps the value stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    // ──────────────────── collaborator accessors ────────────────────

    #[must_use]
    pub fn check_reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper.check_reaper_interval_secs)
    }

    #[must_use]
    pub fn max_check_reaper_time(&self) -> Duration {
        Duration::from_secs(self.reaper.max_check_reaper_time_secs)
    }

    #[must_use]
    pub fn max_check_result_file_age(&self) -> Duration {
        Duration::from_secs(self.reaper.max_check_result_file_age_secs)
    }

    #[must_use]
    pub fn check_result_path(&self) -> Option<&Path> {
        self.reaper.check_result_path.as_deref()
    }

    #[must_use]
    pub fn host_check_timeout(&self) -> Duration {
        Duration::from_secs(self.checks.host_check_timeout_secs)
    }

    #[must_use]
    pub fn service_check_timeout(&self) -> Duration {
        Duration::from_secs(self.checks.service_check_timeout_secs)
    }

    #[must_use]
    pub fn use_aggressive_host_checking(&self) -> bool {
        self.checks.use_aggressive_host_checking
    }

    /// Auto-rescheduling window in seconds.
    #[must_use]
    pub fn auto_rescheduling_window(&self) -> u64 {
        self.scheduling.auto_rescheduling_window_secs
    }

    /// Seconds per check-interval unit.
    #[must_use]
    pub fn interval_length(&self) -> u64 {
        self.scheduling.interval_length_secs
    }

    // ──────────────────── env overrides ────────────────────

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let lookup = &mut lookup;

        // checks
        set_u64(
            lookup,
            "VIGIL_CHECKS_HOST_CHECK_TIMEOUT_SECS",
            &mut self.checks.host_check_timeout_secs,
        )?;
        set_u64(
            lookup,
            "VIGIL_CHECKS_SERVICE_CHECK_TIMEOUT_SECS",
            &mut self.checks.service_check_timeout_secs,
        )?;
        set_bool(
            lookup,
            "VIGIL_CHECKS_USE_AGGRESSIVE_HOST_CHECKING",
            &mut self.checks.use_aggressive_host_checking,
        )?;
        set_bool(
            lookup,
            "VIGIL_CHECKS_EXECUTE_HOST_CHECKS",
            &mut self.checks.execute_host_checks,
        )?;
        set_bool(
            lookup,
            "VIGIL_CHECKS_EXECUTE_SERVICE_CHECKS",
            &mut self.checks.execute_service_checks,
        )?;
        set_usize(
            lookup,
            "VIGIL_CHECKS_MAX_PARALLEL_SERVICE_CHECKS",
            &mut self.checks.max_parallel_service_checks,
        )?;
        set_u64(
            lookup,
            "VIGIL_CHECKS_CACHED_HOST_CHECK_HORIZON_SECS",
            &mut self.checks.cached_host_check_horizon_secs,
        )?;

        // reaper
        set_u64(
            lookup,
            "VIGIL_REAPER_CHECK_REAPER_INTERVAL_SECS",
            &mut self.reaper.check_reaper_interval_secs,
        )?;
        set_u64(
            lookup,
            "VIGIL_REAPER_MAX_CHECK_REAPER_TIME_SECS",
            &mut self.reaper.max_check_reaper_time_secs,
        )?;
        set_u64(
            lookup,
            "VIGIL_REAPER_MAX_CHECK_RESULT_FILE_AGE_SECS",
            &mut self.reaper.max_check_result_file_age_secs,
        )?;
        if let Some(raw) = lookup("VIGIL_REAPER_CHECK_RESULT_PATH") {
            self.reaper.check_result_path = if raw.is_empty() {
                None
            } else {
                Some(PathBuf::from(raw))
            };
        }

        // scheduling
        set_u64(
            lookup,
            "VIGIL_SCHEDULING_INTERVAL_LENGTH_SECS",
            &mut self.scheduling.interval_length_secs,
        )?;
        set_bool(
            lookup,
            "VIGIL_SCHEDULING_AUTO_RESCHEDULE_CHECKS",
            &mut self.scheduling.auto_reschedule_checks,
        )?;
        set_u64(
            lookup,
            "VIGIL_SCHEDULING_AUTO_RESCHEDULING_INTERVAL_SECS",
            &mut self.scheduling.auto_rescheduling_interval_secs,
        )?;
        set_u64(
            lookup,
            "VIGIL_SCHEDULING_AUTO_RESCHEDULING_WINDOW_SECS",
            &mut self.scheduling.auto_rescheduling_window_secs,
        )?;
        set_u64(
            lookup,
            "VIGIL_SCHEDULING_TIME_CHANGE_THRESHOLD_SECS",
            &mut self.scheduling.time_change_threshold_secs,
        )?;
        set_u64(
            lookup,
            "VIGIL_SCHEDULING_SLEEP_TIME_MS",
            &mut self.scheduling.sleep_time_ms,
        )?;

        // execution
        set_usize(
            lookup,
            "VIGIL_EXECUTION_WORKER_THREADS",
            &mut self.execution.worker_threads,
        )?;

        // paths
        if let Some(raw) = lookup("VIGIL_PATHS_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }
        Ok(())
    }

    fn normalize_paths(&mut self) {
        if let Some(path) = self.reaper.check_result_path.as_mut() {
            let s = path.to_string_lossy();
            if s.len() > 1
                && let Some(stripped) = s.strip_suffix('/')
            {
                *path = PathBuf::from(stripped);
            }
        }
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, val) in [
            (
                "checks.host_check_timeout_secs",
                self.checks.host_check_timeout_secs,
            ),
            (
                "checks.service_check_timeout_secs",
                self.checks.service_check_timeout_secs,
            ),
            (
                "reaper.check_reaper_interval_secs",
                self.reaper.check_reaper_interval_secs,
            ),
            (
                "reaper.max_check_reaper_time_secs",
                self.reaper.max_check_reaper_time_secs,
            ),
            (
                "scheduling.interval_length_secs",
                self.scheduling.interval_length_secs,
            ),
            (
                "scheduling.time_change_threshold_secs",
                self.scheduling.time_change_threshold_secs,
            ),
        ] {
            if val == 0 {
                return Err(VigilError::InvalidConfig {
                    details: format!("{name} must be >= 1"),
                });
            }
        }

        if self.scheduling.auto_reschedule_checks
            && (self.scheduling.auto_rescheduling_window_secs == 0
                || self.scheduling.auto_rescheduling_interval_secs == 0)
        {
            return Err(VigilError::InvalidConfig {
                details: "scheduling.auto_rescheduling_window_secs and \
                          auto_rescheduling_interval_secs must be >= 1 when auto-rescheduling"
                    .to_string(),
            });
        }

        for (name, delay) in [
            (
                "host_inter_check_delay",
                self.scheduling.host_inter_check_delay,
            ),
            (
                "service_inter_check_delay",
                self.scheduling.service_inter_check_delay,
            ),
        ] {
            if let InterCheckDelay::User(value) = delay
                && (!value.is_finite() || value < 0.0)
            {
                return Err(VigilError::InvalidConfig {
                    details: format!("scheduling.{name} must be a finite value >= 0, got {value}"),
                });
            }
        }

        if self.scheduling.service_interleave_factor == InterleaveFactor::User(0) {
            return Err(VigilError::InvalidConfig {
                details: "scheduling.service_interleave_factor must be >= 1".to_string(),
            });
        }

        if self.execution.worker_threads == 0 {
            return Err(VigilError::InvalidConfig {
                details: "execution.worker_threads must be >= 1".to_string(),
            });
        }

        self.validate_objects()
    }

    fn validate_objects(&self) -> Result<()> {
        let mut commands = HashSet::new();
        for command in &self.objects.commands {
            if command.name.is_empty() || command.command_line.is_empty() {
                return Err(VigilError::InvalidConfig {
                    details: "objects.commands entries need a name and a command_line".to_string(),
                });
            }
            if !commands.insert(command.name.as_str()) {
                return Err(VigilError::InvalidConfig {
                    details: format!("duplicate command {:?}", command.name),
                });
            }
        }

        let check_command = |owner: &str, raw: Option<&String>| -> Result<()> {
            let Some(raw) = raw else {
                return Ok(());
            };
            let name = raw.split('!').next().unwrap_or_default();
            if commands.contains(name) {
                Ok(())
            } else {
                Err(VigilError::InvalidConfig {
                    details: format!("{owner} references unknown command {name:?}"),
                })
            }
        };

        let mut hosts = HashSet::new();
        for host in &self.objects.hosts {
            if host.name.is_empty() {
                return Err(VigilError::InvalidConfig {
                    details: "objects.hosts entries need a name".to_string(),
                });
            }
            if !hosts.insert(host.name.as_str()) {
                return Err(VigilError::InvalidConfig {
                    details: format!("duplicate host {:?}", host.name),
                });
            }
            if host.max_check_attempts == 0 {
                return Err(VigilError::InvalidConfig {
                    details: format!("host {:?}: max_check_attempts must be >= 1", host.name),
                });
            }
            check_command(&format!("host {:?}", host.name), host.check_command.as_ref())?;
        }

        let mut services = HashSet::new();
        for service in &self.objects.services {
            let owner = format!("service {:?} on {:?}", service.description, service.host_name);
            if service.description.is_empty() {
                return Err(VigilError::InvalidConfig {
                    details: format!("{owner}: description must not be empty"),
                });
            }
            if !hosts.contains(service.host_name.as_str()) {
                return Err(VigilError::InvalidConfig {
                    details: format!("{owner} references unknown host"),
                });
            }
            if !services.insert((service.host_name.as_str(), service.description.as_str())) {
                return Err(VigilError::InvalidConfig {
                    details: format!("duplicate {owner}"),
                });
            }
            if service.max_check_attempts == 0 {
                return Err(VigilError::InvalidConfig {
                    details: format!("{owner}: max_check_attempts must be >= 1"),
                });
            }
            if service.check_command.is_none() {
                return Err(VigilError::InvalidConfig {
                    details: format!("{owner} has no check_command"),
                });
            }
            check_command(&owner, service.check_command.as_ref())?;
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok()
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<u64>().map_err(|error| VigilError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_usize<F>(lookup: &mut F, name: &str, slot: &mut usize) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .parse::<usize>()
            .map_err(|error| VigilError::ConfigParse {
                context: "env",
                details: format!("{name}={raw:?}: {error}"),
            })?;
    }
    Ok(())
}

fn set_bool<F>(lookup: &mut F, name: &str, slot: &mut bool) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env_bool(name, &raw)?;
    }
    Ok(())
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => other.parse::<bool>().map_err(|error| VigilError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        }),
    }
}
