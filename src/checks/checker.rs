//! Active check dispatch and result reaping.
//!
//! A dispatched check leaves a skeleton [`CheckResult`] in `pending` under
//! its command id. The backend reports completion on its own thread through
//! [`CompletionSink::finished`], which only stages a partial result: it
//! knows the exit code and output but not which object the check was for.
//! [`Checker::reap`] merges partials into their skeletons, queues the
//! merged results and applies them one at a time.
//!
//! One mutex guards all four queues. It is never held while a result is
//! applied to its object.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::checks::broker::{
    BrokerSink, BrokerVerdict, CheckNotice, CheckStage, NullBroker, SystemCommandNotice,
    SystemCommandStage,
};
use crate::checks::check_result::{CheckOptions, CheckResult, CheckSource, CheckType};
use crate::checks::command::{Command, CommandRegistry, Macros, split_check_command};
use crate::checks::execution::{
    CommandBackend, CommandId, CompletionSink, ExecutionResult, ExecutionStatus,
};
use crate::checks::result_queue::process_check_result_queue;
use crate::core::clock::{self, Timeval};
use crate::core::config::Config;
use crate::core::errors::{Result, VigilError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::objects::output::parse_check_output;
use crate::objects::{
    Checkable, HostCheckable, HostState, ObjectRef, ObjectRegistry, STATE_OK, STATE_UNKNOWN,
    STATE_WARNING,
};

/// Output given to a check whose command could not be launched.
pub const EXECUTE_FAILED_OUTPUT: &str = "(Execute command failed)";

// ──────────────────── settings ────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerSettings {
    pub host_check_timeout: Duration,
    pub service_check_timeout: Duration,
    pub use_aggressive_host_checking: bool,
    pub max_check_reaper_time: Duration,
    pub check_result_path: Option<PathBuf>,
    pub max_check_result_file_age: Duration,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            host_check_timeout: Duration::from_secs(30),
            service_check_timeout: Duration::from_secs(60),
            use_aggressive_host_checking: false,
            max_check_reaper_time: Duration::from_secs(30),
            check_result_path: None,
            max_check_result_file_age: Duration::from_secs(3600),
        }
    }
}

impl CheckerSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            host_check_timeout: config.host_check_timeout(),
            service_check_timeout: config.service_check_timeout(),
            use_aggressive_host_checking: config.use_aggressive_host_checking(),
            max_check_reaper_time: config.max_check_reaper_time(),
            check_result_path: config.check_result_path().map(PathBuf::from),
            max_check_result_file_age: config.max_check_result_file_age(),
        }
    }
}

// ──────────────────── statistics ────────────────────

#[derive(Debug, Default)]
struct CheckStats {
    running_host_checks: AtomicU64,
    running_service_checks: AtomicU64,
    scheduled_host_checks: AtomicU64,
    on_demand_host_checks: AtomicU64,
    scheduled_service_checks: AtomicU64,
    on_demand_service_checks: AtomicU64,
    cached_host_checks: AtomicU64,
    launch_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckStatsSnapshot {
    pub running_host_checks: u64,
    pub running_service_checks: u64,
    pub scheduled_host_checks: u64,
    pub on_demand_host_checks: u64,
    pub scheduled_service_checks: u64,
    pub on_demand_service_checks: u64,
    pub cached_host_checks: u64,
    pub launch_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn settle(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
}

impl CheckStats {
    fn record_dispatch(&self, object: ObjectRef, scheduled: bool) {
        match (object, scheduled) {
            (ObjectRef::Host(_), true) => bump(&self.scheduled_host_checks),
            (ObjectRef::Host(_), false) => bump(&self.on_demand_host_checks),
            (ObjectRef::Service(_), true) => bump(&self.scheduled_service_checks),
            (ObjectRef::Service(_), false) => bump(&self.on_demand_service_checks),
        }
        match object {
            ObjectRef::Host(_) => bump(&self.running_host_checks),
            ObjectRef::Service(_) => bump(&self.running_service_checks),
        }
    }

    fn record_completion(&self, source: CheckSource) {
        match source {
            CheckSource::Host => settle(&self.running_host_checks),
            CheckSource::Service => settle(&self.running_service_checks),
        }
    }

    fn snapshot(&self) -> CheckStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CheckStatsSnapshot {
            running_host_checks: load(&self.running_host_checks),
            running_service_checks: load(&self.running_service_checks),
            scheduled_host_checks: load(&self.scheduled_host_checks),
            on_demand_host_checks: load(&self.on_demand_host_checks),
            scheduled_service_checks: load(&self.scheduled_service_checks),
            on_demand_service_checks: load(&self.on_demand_service_checks),
            cached_host_checks: load(&self.cached_host_checks),
            launch_failures: load(&self.launch_failures),
        }
    }
}

// ──────────────────── reap state ────────────────────

#[derive(Debug, Default)]
struct ReapQueues {
    /// Skeletons of dispatched checks, by command id.
    pending: HashMap<CommandId, CheckResult>,
    /// Completions not yet merged with their skeleton.
    partial: BTreeMap<CommandId, CheckResult>,
    to_reap: VecDeque<CheckResult>,
    /// Results submitted through the older list interface.
    legacy: Vec<CheckResult>,
    /// Submissions refused since the last reap for lacking a host or output.
    rejected: usize,
}

impl ReapQueues {
    fn accept(&mut self, result: &CheckResult) -> bool {
        if result.is_complete() {
            return true;
        }
        eprintln!(
            "[VGL-CHECKER] dropping incomplete check result for {:?} host#{}",
            result.object_check_type, result.host_id.0
        );
        self.rejected += 1;
        false
    }
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<ReapQueues>,
    /// Submissions between `run_async` and the skeleton landing in `pending`.
    launching: AtomicUsize,
}

impl CompletionSink for Shared {
    fn finished(&self, result: ExecutionResult) {
        let partial = CheckResult {
            finish_time: result.end_time,
            early_timeout: result.status == ExecutionStatus::Timeout,
            exited_ok: matches!(
                result.status,
                ExecutionStatus::Normal | ExecutionStatus::Timeout
            ),
            return_code: result.exit_code,
            output: result.output,
            ..CheckResult::default()
        };
        self.queues.lock().partial.insert(result.command_id, partial);
    }
}

// ──────────────────── outcomes ────────────────────

/// What `run` did when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched(CommandId),
    /// An unforced check of this object is already in flight.
    AlreadyRunning,
    /// The broker supplied the result itself.
    Overridden,
    /// Submission failed; a synthetic UNKNOWN result was queued instead.
    LaunchFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapSummary {
    pub applied: usize,
    pub missing_target: usize,
    pub handler_errors: usize,
    /// Completions that had no skeleton.
    pub orphaned: usize,
    /// Submissions refused for lacking a host or output.
    pub incomplete: usize,
    pub files: usize,
    /// Results left for the next pass.
    pub remaining: usize,
    pub duration_ms: u64,
}

// ──────────────────── checker ────────────────────

pub struct Checker {
    shared: Arc<Shared>,
    backend: Arc<dyn CommandBackend>,
    commands: Arc<CommandRegistry>,
    registry: Arc<dyn ObjectRegistry>,
    broker: Arc<dyn BrokerSink>,
    settings: CheckerSettings,
    stats: CheckStats,
    shutdown: Arc<AtomicBool>,
    logger: ActivityLoggerHandle,
}

impl Checker {
    #[must_use]
    pub fn new(
        settings: CheckerSettings,
        backend: Arc<dyn CommandBackend>,
        commands: Arc<CommandRegistry>,
        registry: Arc<dyn ObjectRegistry>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            backend,
            commands,
            registry,
            broker: Arc::new(NullBroker),
            settings,
            stats: CheckStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            logger: ActivityLoggerHandle::disabled(),
        }
    }

    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn BrokerSink>) -> Self {
        self.broker = broker;
        self
    }

    /// Flag that ends a reap pass early once set.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: ActivityLoggerHandle) -> Self {
        self.logger = logger;
        self
    }

    #[must_use]
    pub const fn settings(&self) -> &CheckerSettings {
        &self.settings
    }

    #[must_use]
    pub fn stats(&self) -> CheckStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.queues.lock().pending.len()
    }

    const fn timeout_for(&self, object: ObjectRef) -> Duration {
        match object {
            ObjectRef::Host(_) => self.settings.host_check_timeout,
            ObjectRef::Service(_) => self.settings.service_check_timeout,
        }
    }

    fn resolve(&self, object: &dyn Checkable, raw: &str) -> Result<(Arc<Command>, Macros)> {
        let (name, args) = split_check_command(raw);
        let command = self.commands.find(name).ok_or_else(|| VigilError::CheckSetup {
            object: object.name(),
            details: format!("check command {name:?} is not defined"),
        })?;
        let mut macros = object.macros();
        macros.set_args(&args);
        Ok((command, macros))
    }

    /// Launch an active check of `object` without waiting for it.
    ///
    /// # Errors
    /// `CheckSetup` when there is no usable check command, `CheckViability`
    /// when the object may not be checked now, `BrokerCancelled` on a
    /// broker veto. The last two carry a preferred retry time.
    pub fn run(
        &self,
        object: &dyn Checkable,
        options: CheckOptions,
        latency: f64,
        scheduled: bool,
        reschedule: bool,
    ) -> Result<DispatchOutcome> {
        let target = object.object();
        let name = object.name();
        let Some(raw) = object.check_command() else {
            return Err(VigilError::CheckSetup {
                object: name,
                details: "no check command defined".to_string(),
            });
        };

        let now = clock::now();
        let viability = object.verify_check_viability(options, now);
        if !viability.viable {
            return Err(VigilError::CheckViability {
                object: name,
                preferred_time: viability.preferred_time,
            });
        }

        if object.status().lock().is_executing && !options.is_forced() {
            return Ok(DispatchOutcome::AlreadyRunning);
        }

        let timeout = self.timeout_for(target);
        let mut notice = CheckNotice::new(CheckStage::AsyncPrecheck, target, &name);
        notice.options = options;
        notice.latency = latency;
        notice.timeout = timeout.as_secs();
        match self.broker.check(&notice) {
            BrokerVerdict::Continue => {}
            BrokerVerdict::Cancel => {
                return Err(VigilError::BrokerCancelled {
                    object: name,
                    preferred_time: None,
                });
            }
            BrokerVerdict::Override => return Ok(DispatchOutcome::Overridden),
        }

        let (command, macros) = self.resolve(object, raw)?;
        let processed = command.process_cmd_line(&macros);

        let start_time = Timeval::now();
        notice.stage = CheckStage::Initiate;
        notice.command_line = Some(&processed);
        notice.start_time = start_time;
        let _ = self.broker.check(&notice);

        self.stats.record_dispatch(target, scheduled);
        {
            let mut st = object.status().lock();
            st.latency = latency;
            // A scheduled run consumes any forced flag.
            st.check_options = if scheduled {
                CheckOptions::NONE
            } else {
                options
            };
            st.check_type = CheckType::Active;
            st.is_executing = true;
            if !scheduled {
                st.next_check = now;
            }
        }
        object.update_status();

        let (source, service_id) = match target {
            ObjectRef::Host(_) => (CheckSource::Host, None),
            ObjectRef::Service(id) => (CheckSource::Service, Some(id)),
        };
        let skeleton = CheckResult {
            object_check_type: source,
            host_id: object.host_id(),
            service_id,
            check_type: CheckType::Active,
            check_options: options,
            reschedule_check: reschedule,
            latency,
            start_time,
            finish_time: start_time,
            ..CheckResult::default()
        };

        let sink: Arc<dyn CompletionSink> = Arc::clone(&self.shared) as Arc<dyn CompletionSink>;
        self.shared.launching.fetch_add(1, Ordering::AcqRel);
        let submitted = match self
            .backend
            .run_async(&processed, &macros, timeout, Arc::clone(&sink))
        {
            Err(VigilError::Interrupted { .. }) => {
                self.backend.run_async(&processed, &macros, timeout, sink)
            }
            other => other,
        };

        match submitted {
            Ok(id) => {
                {
                    let mut queues = self.shared.queues.lock();
                    queues.pending.insert(id, skeleton);
                    self.shared.launching.fetch_sub(1, Ordering::AcqRel);
                }
                self.logger.send(ActivityEvent::CheckDispatched {
                    object: name,
                    command: command.name().to_string(),
                    command_id: id,
                    latency,
                });
                Ok(DispatchOutcome::Dispatched(id))
            }
            Err(err) => {
                self.shared.launching.fetch_sub(1, Ordering::AcqRel);
                eprintln!("[VGL-CHECKER] launching check of {name} failed: {err}");
                bump(&self.stats.launch_failures);
                self.logger.send(ActivityEvent::CheckLaunchFailed {
                    object: name,
                    command: command.name().to_string(),
                    error_code: err.code().to_string(),
                    error_message: err.to_string(),
                });
                let mut failed = skeleton;
                failed.finish_time = Timeval::now();
                failed.return_code = STATE_UNKNOWN;
                failed.exited_ok = true;
                failed.output = EXECUTE_FAILED_OUTPUT.to_string();
                self.push_check_result(failed);
                Ok(DispatchOutcome::LaunchFailed)
            }
        }
    }

    /// Check a host and wait for the answer.
    ///
    /// A non-viable host keeps its current state. With `use_cached` and an
    /// unforced check, a result no older than `cache_horizon` seconds is
    /// reused without running anything.
    pub fn run_sync(
        &self,
        host: &dyn HostCheckable,
        options: CheckOptions,
        use_cached: bool,
        cache_horizon: u64,
    ) -> Result<HostState> {
        let now = clock::now();
        let current = HostState::from_code(host.status().lock().current_state);
        if !host.verify_check_viability(options, now).viable {
            return Ok(current);
        }

        if use_cached && !options.is_forced() {
            let st = host.status().lock();
            let horizon = i64::try_from(cache_horizon).unwrap_or(i64::MAX);
            if st.has_been_checked && now.saturating_sub(st.last_check) <= horizon {
                bump(&self.stats.cached_host_checks);
                bump(&self.stats.on_demand_host_checks);
                return Ok(current);
            }
        }

        bump(&self.stats.on_demand_host_checks);
        let old_output = {
            let mut st = host.status().lock();
            st.latency = 0.0;
            st.has_been_checked = true;
            st.check_options = CheckOptions::NONE;
            st.plugin_output.clone()
        };

        let start_time = Timeval::now();
        let raw_state = self.execute_sync(host)?;
        let state = host.process_check_result_3x(raw_state, &old_output, options, now)?;

        let name = host.name();
        let st = host.status().lock();
        let mut notice = CheckNotice::new(CheckStage::Processed, host.object(), &name);
        notice.options = options;
        notice.timeout = self.settings.host_check_timeout.as_secs();
        notice.start_time = start_time;
        notice.end_time = Timeval::now();
        notice.return_code = state.code();
        notice.output = Some(&st.plugin_output);
        let _ = self.broker.check(&notice);
        Ok(state)
    }

    /// Run a host's check command in the calling thread and map the exit
    /// code to UP or DOWN.
    pub fn execute_sync(&self, host: &dyn HostCheckable) -> Result<HostState> {
        let name = host.name();
        let target = host.object();
        let timeout = self.settings.host_check_timeout;
        let current = HostState::from_code(host.status().lock().current_state);

        let mut notice = CheckNotice::new(CheckStage::SyncPrecheck, target, &name);
        notice.timeout = timeout.as_secs();
        if self.broker.check(&notice) != BrokerVerdict::Continue {
            return Ok(current);
        }

        let start_time = Timeval::now();
        host.status().lock().last_check = start_time.sec;

        let (mut code, output, execution_time) = match host.check_command() {
            None => (STATE_OK, "(Host assumed to be UP)".to_string(), 0.0),
            Some(raw) => {
                let (command, macros) = self.resolve(host, raw)?;
                let processed = command.process_cmd_line(&macros);

                let mut raw_start = CheckNotice::new(CheckStage::RawStart, target, &name);
                raw_start.timeout = timeout.as_secs();
                raw_start.command_line = Some(&processed);
                raw_start.start_time = start_time;
                let _ = self.broker.check(&raw_start);

                let mut sys = SystemCommandNotice {
                    stage: SystemCommandStage::Start,
                    command_line: &processed,
                    timeout: timeout.as_secs(),
                    start_time: Timeval::now(),
                    end_time: Timeval::ZERO,
                    early_timeout: false,
                    return_code: 0,
                    output: None,
                };
                self.broker.system_command(&sys);

                match self.backend.run_sync(&processed, &macros, timeout) {
                    Ok(result) => {
                        let timed_out = result.status == ExecutionStatus::Timeout;
                        sys.stage = SystemCommandStage::End;
                        sys.start_time = result.start_time;
                        sys.end_time = result.end_time;
                        sys.early_timeout = timed_out;
                        sys.return_code = result.exit_code;
                        sys.output = Some(&result.output);
                        self.broker.system_command(&sys);

                        let elapsed = result.end_time.seconds_since(result.start_time).max(0.0);
                        if timed_out {
                            eprintln!(
                                "[VGL-CHECKER] host check {processed:?} for {name} timed out after {} seconds",
                                timeout.as_secs()
                            );
                            let text = format!(
                                "(Host check timed out after {} seconds)",
                                timeout.as_secs()
                            );
                            (result.exit_code, text, elapsed)
                        } else {
                            (result.exit_code, result.output.clone(), elapsed)
                        }
                    }
                    Err(err) => {
                        eprintln!("[VGL-CHECKER] host check of {name} failed to run: {err}");
                        bump(&self.stats.launch_failures);
                        (STATE_UNKNOWN, EXECUTE_FAILED_OUTPUT.to_string(), 0.0)
                    }
                }
            }
        };

        let mut parsed = parse_check_output(&output);
        if parsed.short_output.is_empty() {
            parsed.short_output = "(No output returned from host check)".to_string();
        }
        parsed.short_output = parsed.short_output.replace(';', ":");

        if !self.settings.use_aggressive_host_checking && code == STATE_WARNING {
            code = STATE_OK;
        }
        let state = if code == STATE_OK {
            HostState::Up
        } else {
            HostState::Down
        };

        let end_time = Timeval::now();
        {
            let mut st = host.status().lock();
            st.execution_time = execution_time;
            st.check_type = CheckType::Active;
            st.plugin_output = parsed.short_output;
            st.long_plugin_output = parsed.long_output;
            st.perf_data = parsed.perf_data;

            notice.stage = CheckStage::RawEnd;
            notice.command_line = None;
            notice.start_time = start_time;
            notice.end_time = end_time;
            notice.return_code = state.code();
            notice.output = Some(&st.plugin_output);
            let _ = self.broker.check(&notice);
        }
        Ok(state)
    }

    /// Queue a finished result for the next reap. Results without a host
    /// or without output are dropped.
    pub fn push_check_result(&self, result: CheckResult) {
        let mut queues = self.shared.queues.lock();
        if queues.accept(&result) {
            queues.to_reap.push_back(result);
        }
    }

    /// Older submission interface; drained into the reap queue by `reap`.
    /// Same completeness rule as [`Checker::push_check_result`].
    pub fn add_check_result_to_list(&self, result: CheckResult) {
        let mut queues = self.shared.queues.lock();
        if queues.accept(&result) {
            queues.legacy.push(result);
        }
    }

    /// Completion callback for backends that are not handed the sink.
    pub fn finished(&self, result: ExecutionResult) {
        self.shared.finished(result);
    }

    #[must_use]
    pub fn reaper_is_empty(&self) -> bool {
        let queues = self.shared.queues.lock();
        queues.to_reap.is_empty() && queues.partial.is_empty() && queues.legacy.is_empty()
    }

    fn ingest_result_files(&self, summary: &mut ReapSummary) {
        let Some(dir) = self.settings.check_result_path.as_deref() else {
            return;
        };
        let scan = process_check_result_queue(
            dir,
            self.settings.max_check_result_file_age,
            self.registry.as_ref(),
            &mut |result| self.push_check_result(result),
        );
        match scan {
            Ok(scan) => {
                summary.files = scan.processed.len();
                for (path, results) in scan.processed {
                    self.logger.send(ActivityEvent::ResultFileProcessed {
                        path: path.display().to_string(),
                        results,
                    });
                }
                for (path, age_secs) in scan.stale {
                    self.logger.send(ActivityEvent::ResultFileStale {
                        path: path.display().to_string(),
                        age_secs,
                    });
                }
                if let Some(err) = scan.error {
                    eprintln!("[VGL-REAPER] check result queue pass stopped: {err}");
                }
            }
            Err(err) => {
                eprintln!("[VGL-REAPER] cannot read check result queue: {err}");
                self.logger.send(ActivityEvent::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    /// Move legacy results and merged completions into the reap queue.
    ///
    /// Returns the orphan count and the number of refused submissions. A
    /// completion without a skeleton is kept for the next pass while a
    /// launch is still between submission and registration.
    fn merge(&self) -> (usize, usize) {
        let mut queues = self.shared.queues.lock();
        let launching = self.shared.launching.load(Ordering::Acquire) > 0;
        let ReapQueues {
            pending,
            partial,
            to_reap,
            legacy,
            rejected,
        } = &mut *queues;
        to_reap.extend(legacy.drain(..));

        let mut orphaned = 0;
        for (id, done) in std::mem::take(partial) {
            let Some(mut merged) = pending.remove(&id) else {
                if launching {
                    partial.insert(id, done);
                    continue;
                }
                eprintln!("[VGL-REAPER] command id {id} not found; dropping its result");
                orphaned += 1;
                continue;
            };
            merged.finish_time = done.finish_time;
            merged.early_timeout = done.early_timeout;
            merged.return_code = done.return_code;
            merged.exited_ok = done.exited_ok;
            merged.output = done.output;
            to_reap.push_back(merged);
        }
        (orphaned, std::mem::take(rejected))
    }

    fn apply(&self, result: &CheckResult, summary: &mut ReapSummary) {
        if result.check_type == CheckType::Active {
            self.stats.record_completion(result.object_check_type);
        }
        let Some(target) = result.object().and_then(|o| self.registry.checkable(o)) else {
            eprintln!(
                "[VGL-REAPER] result for {:?} host#{} could not be matched to an object",
                result.object_check_type, result.host_id.0
            );
            summary.missing_target += 1;
            self.logger.send(ActivityEvent::CheckResultDropped {
                object: result
                    .object()
                    .map_or_else(|| "unresolved".to_string(), |o| o.to_string()),
                reason: "target not found".to_string(),
            });
            return;
        };
        match target.handle_async_check_result(result) {
            Ok(()) => {
                summary.applied += 1;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let execution_ms = (result.execution_time() * 1000.0) as u64;
                self.logger.send(ActivityEvent::CheckResultApplied {
                    object: target.name(),
                    return_code: result.return_code,
                    execution_ms,
                });
            }
            Err(err) => {
                eprintln!("[VGL-REAPER] applying result to {} failed: {err}", target.name());
                summary.handler_errors += 1;
                self.logger.send(ActivityEvent::CheckResultDropped {
                    object: target.name(),
                    reason: err.to_string(),
                });
            }
        }
    }

    /// Collect and apply finished results.
    ///
    /// Stops early once the configured maximum reaper time has passed or
    /// shutdown was requested; leftovers wait for the next pass.
    pub fn reap(&self) -> ReapSummary {
        let started = Instant::now();
        let mut summary = ReapSummary::default();

        self.ingest_result_files(&mut summary);
        (summary.orphaned, summary.incomplete) = self.merge();

        loop {
            let Some(result) = self.shared.queues.lock().to_reap.pop_front() else {
                break;
            };
            self.apply(&result, &mut summary);

            if started.elapsed() > self.settings.max_check_reaper_time {
                eprintln!("[VGL-REAPER] max reaper time exceeded; deferring the rest");
                break;
            }
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
        }

        summary.remaining = self.shared.queues.lock().to_reap.len();
        summary.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.logger.send(ActivityEvent::ReaperPass {
            applied: summary.applied,
            dropped: summary.missing_target
                + summary.handler_errors
                + summary.orphaned
                + summary.incomplete,
            remaining: summary.remaining,
            duration_ms: summary.duration_ms,
        });
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{HostDefinition, ServiceDefinition};
    use crate::objects::registry::ObjectStore;
    use crate::objects::{HostId, ServiceId};

    /// Backend that records submissions and never completes on its own.
    #[derive(Default)]
    struct Recording {
        submitted: Mutex<Vec<String>>,
        next: AtomicU64,
        fail_with: Mutex<Vec<VigilError>>,
        sync_result: Mutex<Option<(i32, String, ExecutionStatus)>>,
    }

    impl CommandBackend for Recording {
        fn run_async(
            &self,
            processed: &str,
            _macros: &Macros,
            _timeout: Duration,
            _sink: Arc<dyn CompletionSink>,
        ) -> Result<CommandId> {
            if let Some(err) = self.fail_with.lock().pop() {
                return Err(err);
            }
            self.submitted.lock().push(processed.to_string());
            Ok(self.next.fetch_add(1, Ordering::Relaxed) + 1)
        }

        fn run_sync(&self, processed: &str, _: &Macros, _: Duration) -> Result<ExecutionResult> {
            self.submitted.lock().push(processed.to_string());
            let (exit_code, output, status) = self
                .sync_result
                .lock()
                .clone()
                .unwrap_or((0, "PING OK".to_string(), ExecutionStatus::Normal));
            Ok(ExecutionResult {
                command_id: 0,
                start_time: Timeval::from_secs(1_000),
                end_time: Timeval::from_secs(1_001),
                exit_code,
                status,
                output,
            })
        }
    }

    struct Harness {
        backend: Arc<Recording>,
        store: Arc<ObjectStore>,
        checker: Checker,
    }

    fn harness(aggressive: bool) -> Harness {
        let store = Arc::new(ObjectStore::new(60, aggressive));
        store
            .add_host(&HostDefinition {
                name: "web1".to_string(),
                check_command: Some("check_ping!100".to_string()),
                ..HostDefinition::default()
            })
            .unwrap();
        store
            .add_service(&ServiceDefinition {
                host_name: "web1".to_string(),
                description: "HTTP".to_string(),
                check_command: Some("check_http".to_string()),
                ..ServiceDefinition::default()
            })
            .unwrap();
        let mut commands = CommandRegistry::new();
        commands.insert(Command::new("check_ping", "ping -w $ARG1$ $HOSTADDRESS$").unwrap());
        commands.insert(Command::new("check_http", "http $HOSTADDRESS$").unwrap());
        let backend = Arc::new(Recording::default());
        let checker = Checker::new(
            CheckerSettings {
                use_aggressive_host_checking: aggressive,
                ..CheckerSettings::default()
            },
            backend.clone(),
            Arc::new(commands),
            store.clone(),
        );
        Harness {
            backend,
            store,
            checker,
        }
    }

    #[test]
    fn second_unforced_run_is_a_no_op() {
        let h = harness(false);
        let svc = h.store.get_service(ServiceId(1)).unwrap();
        let first = h.checker.run(svc.as_ref(), CheckOptions::NONE, 0.0, true, true).unwrap();
        assert!(matches!(first, DispatchOutcome::Dispatched(_)));
        let second = h.checker.run(svc.as_ref(), CheckOptions::NONE, 0.0, true, true).unwrap();
        assert_eq!(second, DispatchOutcome::AlreadyRunning);
        assert_eq!(h.backend.submitted.lock().len(), 1);
        assert_eq!(h.checker.pending_len(), 1);

        let forced = h
            .checker
            .run(svc.as_ref(), CheckOptions::FORCE_EXECUTION, 0.0, false, true)
            .unwrap();
        assert!(matches!(forced, DispatchOutcome::Dispatched(_)));
        assert_eq!(h.checker.stats().running_service_checks, 2);
    }

    #[test]
    fn command_line_is_expanded_with_arguments() {
        let h = harness(false);
        let host = h.store.get_host(HostId(1)).unwrap();
        h.checker.run(host.as_ref(), CheckOptions::NONE, 0.5, true, true).unwrap();
        assert_eq!(h.backend.submitted.lock()[0], "ping -w 100 web1");
        let st = host.status().lock();
        assert!(st.is_executing);
        assert!((st.latency - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_command_is_a_setup_error() {
        let h = harness(false);
        h.store
            .add_host(&HostDefinition {
                name: "db1".to_string(),
                check_command: Some("check_nothing".to_string()),
                ..HostDefinition::default()
            })
            .unwrap();
        let host = h.store.get_host(HostId(2)).unwrap();
        let err = h.checker.run(host.as_ref(), CheckOptions::NONE, 0.0, true, true).unwrap_err();
        assert_eq!(err.code(), "VGL-2001");
        assert!(!host.status().lock().is_executing);
    }

    #[test]
    fn launch_failure_queues_unknown_result() {
        let h = harness(false);
        h.backend.fail_with.lock().push(VigilError::Execution {
            command: "http".to_string(),
            details: "no such file".to_string(),
        });
        let svc = h.store.get_service(ServiceId(1)).unwrap();
        let outcome = h.checker.run(svc.as_ref(), CheckOptions::NONE, 0.0, true, true).unwrap();
        assert_eq!(outcome, DispatchOutcome::LaunchFailed);
        assert!(!h.checker.reaper_is_empty());

        let summary = h.checker.reap();
        assert_eq!(summary.applied, 1);
        let st = svc.status().lock();
        assert_eq!(st.current_state, STATE_UNKNOWN);
        assert_eq!(st.plugin_output, EXECUTE_FAILED_OUTPUT);
        assert!(!st.is_executing);
        assert_eq!(h.checker.stats().running_service_checks, 0);
    }

    #[test]
    fn interrupted_submission_is_retried_once() {
        let h = harness(false);
        h.backend.fail_with.lock().push(VigilError::Interrupted {
            command: "http".to_string(),
        });
        let svc = h.store.get_service(ServiceId(1)).unwrap();
        let outcome = h.checker.run(svc.as_ref(), CheckOptions::NONE, 0.0, true, true).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dispatched(_)));
        assert_eq!(h.backend.submitted.lock().len(), 1);
    }

    #[test]
    fn completion_is_merged_with_its_skeleton() {
        let h = harness(false);
        let svc = h.store.get_service(ServiceId(1)).unwrap();
        let DispatchOutcome::Dispatched(id) =
            h.checker.run(svc.as_ref(), CheckOptions::NONE, 0.0, true, true).unwrap()
        else {
            panic!("expected dispatch");
        };
        h.checker.finished(ExecutionResult {
            command_id: id,
            start_time: Timeval::from_secs(2_000),
            end_time: Timeval::from_secs(2_003),
            exit_code: 2,
            status: ExecutionStatus::Normal,
            output: "HTTP CRITICAL - 500".to_string(),
        });
        let summary = h.checker.reap();
        assert_eq!(summary.applied, 1);
        assert_eq!(h.checker.pending_len(), 0);
        let st = svc.status().lock();
        assert_eq!(st.current_state, 2);
        assert_eq!(st.plugin_output, "HTTP CRITICAL - 500");
    }

    #[test]
    fn orphan_completion_is_dropped() {
        let h = harness(false);
        h.checker.finished(ExecutionResult {
            command_id: 99,
            start_time: Timeval::from_secs(1),
            end_time: Timeval::from_secs(2),
            exit_code: 0,
            status: ExecutionStatus::Normal,
            output: "OK".to_string(),
        });
        let summary = h.checker.reap();
        assert_eq!(summary.orphaned, 1);
        assert_eq!(summary.applied, 0);
        assert!(h.checker.reaper_is_empty());
    }

    #[test]
    fn missing_target_does_not_stop_the_pass() {
        let h = harness(false);
        h.checker.push_check_result(CheckResult {
            object_check_type: CheckSource::Service,
            host_id: HostId(1),
            service_id: Some(ServiceId(42)),
            output: "gone".to_string(),
            ..CheckResult::default()
        });
        h.checker.add_check_result_to_list(CheckResult {
            host_id: HostId(1),
            check_type: CheckType::Passive,
            output: "PING OK".to_string(),
            ..CheckResult::default()
        });
        let summary = h.checker.reap();
        assert_eq!(summary.missing_target, 1);
        assert_eq!(summary.applied, 1);
    }

    #[test]
    fn shutdown_flag_ends_pass_after_one_result() {
        let flag = Arc::new(AtomicBool::new(true));
        let h = harness(false);
        let checker = Checker {
            shutdown: Arc::clone(&flag),
            ..h.checker
        };
        for _ in 0..3 {
            checker.push_check_result(CheckResult {
                host_id: HostId(1),
                check_type: CheckType::Passive,
                output: "PING OK".to_string(),
                ..CheckResult::default()
            });
        }
        let summary = checker.reap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.remaining, 2);
    }

    #[test]
    fn results_without_output_are_refused_on_both_entry_points() {
        let h = harness(false);
        let silent = CheckResult {
            host_id: HostId(1),
            check_type: CheckType::Passive,
            ..CheckResult::default()
        };
        h.checker.push_check_result(silent.clone());
        h.checker.add_check_result_to_list(silent);
        h.checker.push_check_result(CheckResult {
            check_type: CheckType::Passive,
            output: "PING OK".to_string(),
            ..CheckResult::default()
        });
        assert!(h.checker.reaper_is_empty());

        let summary = h.checker.reap();
        assert_eq!(summary.applied, 0);
        assert_eq!(summary.missing_target, 0);
        assert_eq!(summary.incomplete, 3);
        let host = h.store.get_host(HostId(1)).unwrap();
        assert!(!host.status().lock().has_been_checked);

        assert_eq!(h.checker.reap().incomplete, 0);
    }

    #[test]
    fn merged_completion_without_output_gets_a_placeholder() {
        let h = harness(false);
        let host = h.store.get_host(HostId(1)).unwrap();
        let DispatchOutcome::Dispatched(id) =
            h.checker.run(host.as_ref(), CheckOptions::NONE, 0.0, true, true).unwrap()
        else {
            panic!("expected dispatch");
        };
        h.checker.finished(ExecutionResult {
            command_id: id,
            start_time: Timeval::from_secs(3_000),
            end_time: Timeval::from_secs(3_001),
            exit_code: 0,
            status: ExecutionStatus::Normal,
            output: String::new(),
        });
        let summary = h.checker.reap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.incomplete, 0);
        assert_eq!(
            host.status().lock().plugin_output,
            "(No output returned from host check)"
        );
    }

    /// Broker that answers the async precheck with a fixed verdict.
    struct Precheck(BrokerVerdict);

    impl BrokerSink for Precheck {
        fn check(&self, notice: &CheckNotice<'_>) -> BrokerVerdict {
            if notice.stage == CheckStage::AsyncPrecheck {
                self.0
            } else {
                BrokerVerdict::Continue
            }
        }
    }

    #[test]
    fn broker_cancel_is_an_error_and_submits_nothing() {
        let h = harness(false);
        let checker = h.checker.with_broker(Arc::new(Precheck(BrokerVerdict::Cancel)));
        let svc = h.store.get_service(ServiceId(1)).unwrap();
        let err = checker
            .run(svc.as_ref(), CheckOptions::NONE, 0.0, true, true)
            .unwrap_err();
        assert_eq!(err.code(), "VGL-2003");
        assert!(h.backend.submitted.lock().is_empty());
        assert_eq!(checker.pending_len(), 0);
        assert!(!svc.status().lock().is_executing);
        assert_eq!(checker.stats().scheduled_service_checks, 0);
    }

    #[test]
    fn broker_override_skips_submission() {
        let h = harness(false);
        let checker = h.checker.with_broker(Arc::new(Precheck(BrokerVerdict::Override)));
        let host = h.store.get_host(HostId(1)).unwrap();
        let outcome = checker
            .run(host.as_ref(), CheckOptions::NONE, 0.0, true, true)
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Overridden);
        assert!(h.backend.submitted.lock().is_empty());
        assert_eq!(checker.pending_len(), 0);
        assert!(!host.status().lock().is_executing);
    }

    #[test]
    fn disabled_object_reports_a_retry_time() {
        let h = harness(false);
        let svc = h.store.get_service(ServiceId(1)).unwrap();
        svc.status().lock().checks_enabled = false;
        let before = clock::now();
        let err = h
            .checker
            .run(svc.as_ref(), CheckOptions::NONE, 0.0, true, true)
            .unwrap_err();
        assert_eq!(err.code(), "VGL-2002");
        let preferred = err.preferred_time().expect("retry time");
        assert!(preferred > before);
        assert!(h.backend.submitted.lock().is_empty());
        assert!(!svc.status().lock().is_executing);

        let forced = h
            .checker
            .run(svc.as_ref(), CheckOptions::FORCE_EXECUTION, 0.0, false, true)
            .unwrap();
        assert!(matches!(forced, DispatchOutcome::Dispatched(_)));
    }

    /// Registry that resolves every host id to `web1`.
    struct Aliased(Arc<ObjectStore>);

    impl ObjectRegistry for Aliased {
        fn host(&self, _id: HostId) -> Option<Arc<dyn HostCheckable>> {
            self.0.host(HostId(1))
        }

        fn service(&self, id: ServiceId) -> Option<Arc<dyn Checkable>> {
            self.0.service(id)
        }

        fn find_host_id(&self, name: &str) -> Option<HostId> {
            self.0.find_host_id(name)
        }

        fn find_service_id(&self, host: HostId, description: &str) -> Option<ServiceId> {
            self.0.find_service_id(host, description)
        }
    }

    #[test]
    fn rejected_result_does_not_stop_the_pass() {
        let h = harness(false);
        let checker = Checker {
            registry: Arc::new(Aliased(Arc::clone(&h.store))),
            ..h.checker
        };
        checker.push_check_result(CheckResult {
            host_id: HostId(9),
            check_type: CheckType::Passive,
            output: "PING CRITICAL".to_string(),
            ..CheckResult::default()
        });
        checker.push_check_result(CheckResult {
            host_id: HostId(1),
            check_type: CheckType::Passive,
            output: "PING OK".to_string(),
            ..CheckResult::default()
        });

        let summary = checker.reap();
        assert_eq!(summary.handler_errors, 1);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.remaining, 0);
        let host = h.store.get_host(HostId(1)).unwrap();
        assert_eq!(host.status().lock().plugin_output, "PING OK");
    }

    #[test]
    fn scheduled_run_does_not_keep_the_force_flag() {
        let h = harness(false);
        let svc = h.store.get_service(ServiceId(1)).unwrap();
        h.checker
            .run(svc.as_ref(), CheckOptions::FORCE_EXECUTION, 0.0, true, true)
            .unwrap();
        assert!(!svc.status().lock().check_options.is_forced());

        let host = h.store.get_host(HostId(1)).unwrap();
        h.checker
            .run(host.as_ref(), CheckOptions::FORCE_EXECUTION, 0.0, false, true)
            .unwrap();
        assert!(host.status().lock().check_options.is_forced());
    }

    /// Backend whose command finishes, and gets reaped, before `run_async`
    /// has returned its id.
    #[derive(Default)]
    struct EagerBackend {
        checker: Mutex<Option<Arc<Checker>>>,
        inner_pass: Mutex<Option<ReapSummary>>,
    }

    impl CommandBackend for EagerBackend {
        fn run_async(
            &self,
            _processed: &str,
            _macros: &Macros,
            _timeout: Duration,
            sink: Arc<dyn CompletionSink>,
        ) -> Result<CommandId> {
            sink.finished(ExecutionResult {
                command_id: 7,
                start_time: Timeval::from_secs(4_000),
                end_time: Timeval::from_secs(4_001),
                exit_code: 0,
                status: ExecutionStatus::Normal,
                output: "HTTP OK".to_string(),
            });
            let checker = self.checker.lock().clone();
            if let Some(checker) = checker {
                *self.inner_pass.lock() = Some(checker.reap());
            }
            Ok(7)
        }

        fn run_sync(&self, processed: &str, _: &Macros, _: Duration) -> Result<ExecutionResult> {
            Err(VigilError::Execution {
                command: processed.to_string(),
                details: "not supported".to_string(),
            })
        }
    }

    #[test]
    fn completion_reaped_before_registration_is_kept() {
        let h = harness(false);
        let backend = Arc::new(EagerBackend::default());
        let checker = Arc::new(Checker {
            backend: backend.clone(),
            ..h.checker
        });
        *backend.checker.lock() = Some(Arc::clone(&checker));

        let svc = h.store.get_service(ServiceId(1)).unwrap();
        let outcome = checker
            .run(svc.as_ref(), CheckOptions::NONE, 0.0, true, true)
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Dispatched(7));

        let inner = backend.inner_pass.lock().take().expect("reaped during launch");
        assert_eq!(inner.orphaned, 0);
        assert_eq!(inner.applied, 0);

        let summary = checker.reap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.orphaned, 0);
        assert_eq!(svc.status().lock().plugin_output, "HTTP OK");
        assert!(!svc.status().lock().is_executing);

        backend.checker.lock().take();
    }

    #[test]
    fn cached_state_is_reused_within_horizon() {
        let h = harness(false);
        let host = h.store.get_host(HostId(1)).unwrap();
        {
            let mut st = host.status().lock();
            st.has_been_checked = true;
            st.last_check = clock::now() - 5;
        }
        let state = h.checker.run_sync(host.as_ref(), CheckOptions::NONE, true, 60).unwrap();
        assert_eq!(state, HostState::Up);
        assert!(h.backend.submitted.lock().is_empty());
        assert_eq!(h.checker.stats().cached_host_checks, 1);

        h.checker.run_sync(host.as_ref(), CheckOptions::NONE, true, 2).unwrap();
        assert_eq!(h.backend.submitted.lock().len(), 1);
    }

    #[test]
    fn sync_warning_is_up_unless_aggressive() {
        for (aggressive, expected) in [(false, HostState::Up), (true, HostState::Down)] {
            let h = harness(aggressive);
            *h.backend.sync_result.lock() =
                Some((STATE_WARNING, "PING WARNING; loss 20%".to_string(), ExecutionStatus::Normal));
            let host = h.store.get_host(HostId(1)).unwrap();
            let state = h.checker.execute_sync(host.as_ref()).unwrap();
            assert_eq!(state, expected);
            assert_eq!(host.status().lock().plugin_output, "PING WARNING: loss 20%");
        }
    }

    #[test]
    fn sync_timeout_and_empty_output_get_placeholders() {
        let h = harness(false);
        let host = h.store.get_host(HostId(1)).unwrap();

        *h.backend.sync_result.lock() = Some((STATE_UNKNOWN, String::new(), ExecutionStatus::Timeout));
        assert_eq!(h.checker.execute_sync(host.as_ref()).unwrap(), HostState::Down);
        assert_eq!(
            host.status().lock().plugin_output,
            "(Host check timed out after 30 seconds)"
        );

        *h.backend.sync_result.lock() = Some((STATE_OK, String::new(), ExecutionStatus::Normal));
        assert_eq!(h.checker.execute_sync(host.as_ref()).unwrap(), HostState::Up);
        assert_eq!(
            host.status().lock().plugin_output,
            "(No output returned from host check)"
        );
    }

    #[test]
    fn host_without_command_is_assumed_up() {
        let h = harness(false);
        h.store
            .add_host(&HostDefinition {
                name: "printer".to_string(),
                ..HostDefinition::default()
            })
            .unwrap();
        let host = h.store.get_host(HostId(2)).unwrap();
        assert_eq!(h.checker.execute_sync(host.as_ref()).unwrap(), HostState::Up);
        assert_eq!(host.status().lock().plugin_output, "(Host assumed to be UP)");
        assert!(h.backend.submitted.lock().is_empty());
    }
}
