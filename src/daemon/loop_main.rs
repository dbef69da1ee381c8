//! Engine loop: one value owns the event queue, the checker and the object
//! store, and drives them from a single thread.
//!
//! Each tick looks for a wall-clock jump, then runs the first due
//! high-priority event, else the first due low-priority event. Check
//! execution happens on the backend's worker threads; results come back
//! through the recurring reaper event.

#![allow(missing_docs)]
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;

use crate::checks::broker::{BrokerSink, NullBroker, TimedEventStage};
use crate::checks::check_result::CheckOptions;
use crate::checks::checker::{Checker, CheckerSettings, DispatchOutcome};
use crate::checks::command::CommandRegistry;
use crate::checks::execution::CommandBackend;
use crate::core::clock::{self, Timestamp};
use crate::core::config::Config;
use crate::core::errors::{Result, VigilError};
use crate::daemon::signals::{ShutdownCoordinator, SignalHandler};
use crate::events::adjust::adjust_check_scheduling;
use crate::events::dispatch::{EventHandler, handle_timed_event};
use crate::events::queue::{EventHandle, EventQueue};
use crate::events::sched_info::{SchedulingInfo, schedule_initial_checks};
use crate::events::time_change::{TimeChange, compensate_for_system_time_change};
use crate::events::timed_event::{EventKind, Priority, TimedEvent};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::objects::registry::ObjectStore;
use crate::objects::{Checkable, HostId, ObjectRef, ObjectRegistry, ServiceId};

/// Service checks deferred at the parallelism limit move this many seconds
/// plus up to `NUDGE_JITTER - 1` more.
const NUDGE_BASE_SECS: i64 = 5;
const NUDGE_JITTER: i64 = 10;

// ──────────────────── outcomes ────────────────────

/// Why an engine run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    Restart,
    /// Nothing left to schedule.
    QueueEmpty,
}

impl StopReason {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Restart => "restart",
            Self::QueueEmpty => "event queue empty",
        }
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Ran(EventKind),
    /// A due check was moved instead of run.
    Deferred(EventKind),
    Idle,
    Stopped(StopReason),
}

// ──────────────────── collaborators ────────────────────

/// Everything the engine does not build itself.
pub struct EngineParts {
    pub backend: Arc<dyn CommandBackend>,
    pub broker: Arc<dyn BrokerSink>,
    pub signals: SignalHandler,
    pub logger: ActivityLoggerHandle,
}

impl EngineParts {
    /// Detached signals, no broker and no activity log.
    #[must_use]
    pub fn quiet(backend: Arc<dyn CommandBackend>) -> Self {
        Self {
            backend,
            broker: Arc::new(NullBroker),
            signals: SignalHandler::detached(),
            logger: ActivityLoggerHandle::disabled(),
        }
    }
}

// ──────────────────── engine ────────────────────

pub struct Engine {
    config: Config,
    queue: EventQueue,
    scheduling: SchedulingInfo,
    checker: Checker,
    store: Arc<ObjectStore>,
    broker: Arc<dyn BrokerSink>,
    signals: SignalHandler,
    logger: ActivityLoggerHandle,
    logger_join: Option<thread::JoinHandle<()>>,
    /// Wall-clock time seen by the previous tick.
    last_time: Timestamp,
    /// Time of the tick being processed.
    now: Timestamp,
    started: Instant,
}

impl Engine {
    /// Build an engine around caller-supplied collaborators.
    pub fn new(config: Config, parts: EngineParts) -> Result<Self> {
        let store = Arc::new(ObjectStore::from_config(&config)?);
        let commands = Arc::new(CommandRegistry::from_definitions(&config.objects.commands)?);
        let checker = Checker::new(
            CheckerSettings::from_config(&config),
            parts.backend,
            commands,
            Arc::clone(&store) as Arc<dyn ObjectRegistry>,
        )
        .with_broker(Arc::clone(&parts.broker))
        .with_shutdown_flag(parts.signals.stop_flag())
        .with_logger(parts.logger.clone());

        let now = clock::now();
        Ok(Self {
            config,
            queue: EventQueue::new(),
            scheduling: SchedulingInfo::default(),
            checker,
            store,
            broker: parts.broker,
            signals: parts.signals,
            logger: parts.logger,
            logger_join: None,
            last_time: now,
            now,
            started: Instant::now(),
        })
    }

    /// Production wiring: subprocess backend and the JSONL activity log.
    #[cfg(unix)]
    pub fn init(config: Config, signals: SignalHandler) -> Result<Self> {
        use crate::checks::process::ProcessBackend;
        use crate::logger::activity::{ActivityLoggerConfig, spawn_logger};
        use crate::logger::jsonl::JsonlConfig;

        let backend = ProcessBackend::new(
            config.execution.shell.clone(),
            config.execution.worker_threads,
        )?;
        let (logger, join) = spawn_logger(ActivityLoggerConfig::new(JsonlConfig::at(
            config.paths.activity_log.clone(),
        )))?;
        let parts = EngineParts {
            backend: Arc::new(backend),
            broker: Arc::new(NullBroker),
            signals,
            logger,
        };
        let mut engine = Self::new(config, parts)?;
        engine.logger_join = Some(join);
        Ok(engine)
    }

    #[must_use]
    pub const fn queue(&self) -> &EventQueue {
        &self.queue
    }

    #[must_use]
    pub const fn checker(&self) -> &Checker {
        &self.checker
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    #[must_use]
    pub const fn scheduling(&self) -> &SchedulingInfo {
        &self.scheduling
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub fn log(&self, event: ActivityEvent) {
        self.logger.send(event);
    }

    fn hosts(&self) -> Vec<Arc<dyn Checkable>> {
        self.store
            .hosts()
            .into_iter()
            .map(|h| h as Arc<dyn Checkable>)
            .collect()
    }

    fn services(&self) -> Vec<Arc<dyn Checkable>> {
        self.store
            .services()
            .into_iter()
            .map(|s| s as Arc<dyn Checkable>)
            .collect()
    }

    fn all_objects(&self) -> Vec<Arc<dyn Checkable>> {
        let mut objects = self.hosts();
        objects.extend(self.services());
        objects
    }

    // ──────────────────── queue helpers ────────────────────

    fn notify(&self, stage: TimedEventStage, event: &TimedEvent, priority: Priority) {
        self.broker
            .timed_event(stage, &event.kind, priority, event.run_time);
    }

    /// Queue an event and tell the broker.
    pub fn schedule(&mut self, event: TimedEvent, priority: Priority) -> EventHandle {
        self.notify(TimedEventStage::Add, &event, priority);
        self.queue.schedule(event, priority)
    }

    /// Remove an event and tell the broker.
    pub fn cancel(&mut self, handle: EventHandle) -> Option<TimedEvent> {
        let priority = self.queue.priority_of(handle)?;
        let event = self.queue.remove(handle)?;
        self.notify(TimedEventStage::Remove, &event, priority);
        Some(event)
    }

    fn interval_secs(&self, object: &dyn Checkable) -> i64 {
        let units = object.status().lock().effective_interval().max(1);
        units.saturating_mul(self.config.interval_length()) as i64
    }

    /// Queue a one-shot check for `object` at `at` and record it as the
    /// object's next check.
    fn schedule_check(&mut self, object: &dyn Checkable, at: Timestamp, options: CheckOptions) {
        object.status().lock().next_check = at;
        object.update_status();
        let kind = match object.object() {
            ObjectRef::Host(host) => EventKind::HostCheck { host },
            ObjectRef::Service(service) => EventKind::ServiceCheck { service },
        };
        let event = TimedEvent::once(kind, at)
            .compensated(true)
            .with_options(options);
        self.schedule(event, Priority::Low);
    }

    // ──────────────────── startup ────────────────────

    /// Spread the initial checks and queue the housekeeping events.
    pub fn start(&mut self, now: Timestamp) {
        self.now = now;
        self.last_time = now;
        let hosts = self.hosts();
        let services = self.services();

        self.scheduling =
            SchedulingInfo::compute(&self.config.scheduling, &hosts, &services, now);
        self.scheduling.plan_initial_service_checks(&services, now);
        self.scheduling.plan_initial_host_checks(&hosts, now);

        let mut handles = schedule_initial_checks(&mut self.queue, &services);
        handles.extend(schedule_initial_checks(&mut self.queue, &hosts));
        for handle in handles {
            if let Some(event) = self.queue.get(handle) {
                self.notify(TimedEventStage::Add, event, Priority::Low);
            }
        }

        for object in hosts.iter().chain(services.iter()) {
            let expires = object.status().lock().acknowledgement_expires;
            if let Some(at) = expires {
                let kind = match object.object() {
                    ObjectRef::Host(host) => EventKind::ExpireHostAck { host },
                    ObjectRef::Service(service) => EventKind::ExpireServiceAck { service },
                };
                self.schedule(TimedEvent::once(kind, at), Priority::High);
            }
        }

        let reaper = self.config.reaper.check_reaper_interval_secs;
        self.schedule(
            TimedEvent::every(EventKind::CheckReaper, now + reaper as i64, reaper),
            Priority::High,
        );
        if self.config.scheduling.auto_reschedule_checks {
            let every = self.config.scheduling.auto_rescheduling_interval_secs;
            self.schedule(
                TimedEvent::every(EventKind::RescheduleChecks, now + every as i64, every),
                Priority::High,
            );
        }

        self.logger.send(ActivityEvent::EngineStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: self.config.stable_hash().unwrap_or_default(),
            hosts: hosts.len(),
            services: services.len(),
        });
        eprintln!(
            "[VGL-EVENTS] scheduled {} host and {} service checks",
            self.scheduling.total_scheduled_hosts, self.scheduling.total_scheduled_services
        );
    }

    // ──────────────────── main loop ────────────────────

    /// Run until shutdown, restart, or an empty queue, then shut down.
    pub fn run(&mut self) -> StopReason {
        self.start(clock::now());
        let sleep = Duration::from_millis(self.config.scheduling.sleep_time_ms);
        let reason = loop {
            match self.tick(clock::now()) {
                Tick::Stopped(reason) => break reason,
                Tick::Idle => thread::sleep(sleep),
                Tick::Ran(_) | Tick::Deferred(_) => {}
            }
        };
        self.finish(reason);
        reason
    }

    /// One iteration of the loop at wall-clock time `now`.
    pub fn tick(&mut self, now: Timestamp) -> Tick {
        if self.signals.should_shutdown() {
            return Tick::Stopped(StopReason::Shutdown);
        }
        if self.signals.should_restart() {
            return Tick::Stopped(StopReason::Restart);
        }
        if self.queue.is_empty() {
            return Tick::Stopped(StopReason::QueueEmpty);
        }

        self.detect_time_change(now);
        self.now = now;

        for priority in Priority::ALL {
            let Some((handle, event)) = self.queue.peek(priority) else {
                continue;
            };
            if event.run_time > now {
                continue;
            }
            let event = event.clone();
            if priority == Priority::Low
                && let Some(deferred) = self.defer_check(handle, &event, now)
            {
                return Tick::Deferred(deferred);
            }
            let kind = event.kind;
            self.queue.remove(handle);
            self.execute(event, priority, now);
            return Tick::Ran(kind);
        }

        if let Some((_, next)) = self.queue.peek(Priority::Low) {
            let next = next.clone();
            self.notify(TimedEventStage::Sleep, &next, Priority::Low);
        }
        Tick::Idle
    }

    fn execute(&mut self, event: TimedEvent, priority: Priority, now: Timestamp) {
        self.notify(TimedEventStage::Execute, &event, priority);
        if let Err(err) = handle_timed_event(self, &event, now) {
            eprintln!("[VGL-EVENTS] {} failed: {err}", event.kind);
            self.logger.send(ActivityEvent::Error {
                code: err.code().to_string(),
                message: format!("{}: {err}", event.kind),
            });
        }
        if event.recurring {
            let next = TimedEvent {
                run_time: event.next_run_time(self.now),
                ..event
            };
            self.schedule(next, priority);
        }
    }

    /// Move a due check instead of running it when execution is globally
    /// off or the service parallelism limit is reached. Forced checks run.
    fn defer_check(&mut self, handle: EventHandle, event: &TimedEvent, now: Timestamp) -> Option<EventKind> {
        if event.options.is_forced() {
            return None;
        }
        let (object, enabled) = match event.kind {
            EventKind::ServiceCheck { service } => (
                self.store.service(service)?,
                self.config.checks.execute_service_checks,
            ),
            EventKind::HostCheck { host } => (
                self.store.host(host)? as Arc<dyn Checkable>,
                self.config.checks.execute_host_checks,
            ),
            _ => return None,
        };

        let at = if enabled {
            let limit = self.config.checks.max_parallel_service_checks as u64;
            let running = self.checker.stats().running_service_checks;
            if !matches!(event.kind, EventKind::ServiceCheck { .. }) || limit == 0 || running < limit {
                return None;
            }
            let nudge = NUDGE_BASE_SECS + rand::rng().random_range(0..NUDGE_JITTER);
            eprintln!(
                "[VGL-EVENTS] {running} service checks running (limit {limit}); moving {} by {nudge}s",
                object.name()
            );
            now + nudge
        } else {
            now + self.interval_secs(object.as_ref())
        };

        object.status().lock().next_check = at;
        object.update_status();
        self.queue.reschedule(handle, at);
        Some(event.kind)
    }

    /// Compensate for a backwards jump, or a forward jump of at least the
    /// configured threshold, since the previous tick.
    fn detect_time_change(&mut self, now: Timestamp) {
        let last = self.last_time;
        let threshold = self.config.scheduling.time_change_threshold_secs;
        let jumped = now < last || now.abs_diff(last) >= threshold;
        if jumped {
            if let Err(err) = self.compensate_time_change(last, now) {
                eprintln!("[VGL-EVENTS] time change compensation failed: {err}");
            }
        }
        self.last_time = now;
    }

    /// Move checks whose owners asked for a new next-check time.
    ///
    /// An existing event is moved only when the new time is earlier and the
    /// existing event is not forced.
    pub fn apply_reschedules(&mut self) -> usize {
        let mut moved = 0;
        for (object, next) in self.store.drain_reschedules() {
            let Some(target) = self.store.checkable(object) else {
                continue;
            };
            match self.queue.find_check(object) {
                Some(handle) => {
                    let Some(existing) = self.queue.get(handle) else {
                        continue;
                    };
                    let keep = existing.options.is_forced() || existing.run_time <= next;
                    if keep {
                        target.status().lock().next_check = existing.run_time;
                    } else if self.queue.reschedule(handle, next) {
                        moved += 1;
                    }
                }
                None => {
                    self.schedule_check(target.as_ref(), next, CheckOptions::NONE);
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Reschedule after a dispatch that did not happen.
    fn retry_later(&mut self, object: &dyn Checkable, err: &VigilError, options: CheckOptions) {
        let at = err
            .preferred_time()
            .filter(|t| *t > self.now)
            .unwrap_or_else(|| self.now + self.interval_secs(object));
        self.schedule_check(object, at, options);
    }

    fn run_scheduled(&mut self, object: &Arc<dyn Checkable>, event: &TimedEvent, latency: f64) -> Result<()> {
        match self
            .checker
            .run(object.as_ref(), event.options, latency, true, true)
        {
            Ok(DispatchOutcome::Dispatched(_) | DispatchOutcome::LaunchFailed) => Ok(()),
            Ok(DispatchOutcome::AlreadyRunning | DispatchOutcome::Overridden) => Ok(()),
            Err(err @ (VigilError::CheckViability { .. } | VigilError::BrokerCancelled { .. })) => {
                self.retry_later(object.as_ref(), &err, event.options);
                Ok(())
            }
            Err(err) => {
                self.retry_later(object.as_ref(), &err, event.options);
                Err(err)
            }
        }
    }

    // ──────────────────── shutdown ────────────────────

    /// Final reap, stop log line, logger flush.
    pub fn finish(&mut self, reason: StopReason) {
        let uptime_secs = self.started.elapsed().as_secs();
        let checker = &self.checker;
        let logger = &self.logger;
        let join = &mut self.logger_join;

        let mut final_reap = || {
            let summary = checker.reap();
            summary.handler_errors == 0
        };
        let mut flush_log = || {
            logger.send(ActivityEvent::EngineStopped {
                reason: reason.label().to_string(),
                uptime_secs,
            });
            logger.shutdown();
            join.take().is_none_or(|j| j.join().is_ok())
        };
        let mut steps: [(&str, &mut dyn FnMut() -> bool); 2] = [
            ("final reap", &mut final_reap),
            ("activity log", &mut flush_log),
        ];
        ShutdownCoordinator::new().execute(&mut steps);
        eprintln!(
            "[VGL-EVENTS] engine stopped: {} (uptime={uptime_secs}s)",
            reason.label()
        );
    }
}

// ──────────────────── event handlers ────────────────────

fn unknown(kind: &str, id: u64) -> VigilError {
    VigilError::UnknownObject {
        details: format!("{kind}#{id} no longer exists"),
    }
}

impl EventHandler for Engine {
    fn service_check(&mut self, service: ServiceId, event: &TimedEvent, latency: f64) -> Result<()> {
        let object = self
            .store
            .service(service)
            .ok_or_else(|| unknown("service", service.0))?;
        self.run_scheduled(&object, event, latency)
    }

    fn host_check(&mut self, host: HostId, event: &TimedEvent, latency: f64) -> Result<()> {
        let object = self
            .store
            .host(host)
            .ok_or_else(|| unknown("host", host.0))? as Arc<dyn Checkable>;
        self.run_scheduled(&object, event, latency)
    }

    fn expire_service_ack(&mut self, service: ServiceId) -> Result<()> {
        let object = self
            .store
            .service(service)
            .ok_or_else(|| unknown("service", service.0))?;
        clear_acknowledgement(object.as_ref());
        Ok(())
    }

    fn expire_host_ack(&mut self, host: HostId) -> Result<()> {
        let object = self
            .store
            .host(host)
            .ok_or_else(|| unknown("host", host.0))?;
        clear_acknowledgement(object.as_ref());
        Ok(())
    }

    fn check_reaper(&mut self) -> Result<()> {
        let summary = self.checker.reap();
        let moved = self.apply_reschedules();
        if summary.applied > 0 || summary.remaining > 0 {
            eprintln!(
                "[VGL-REAPER] applied {} results, {} left, {moved} checks rescheduled",
                summary.applied, summary.remaining
            );
        }
        Ok(())
    }

    fn reschedule_checks(&mut self) -> Result<()> {
        let window = self.config.auto_rescheduling_window();
        let adjustment =
            adjust_check_scheduling(&mut self.queue, self.store.as_ref(), window, self.now);
        if adjustment.moved > 0 {
            self.logger.send(ActivityEvent::SchedulingAdjusted {
                checks: adjustment.moved,
                window_secs: window,
            });
        }
        Ok(())
    }

    fn compensate_time_change(&mut self, last: Timestamp, current: Timestamp) -> Result<()> {
        let change = TimeChange::new(last, current);
        let objects = self.all_objects();
        let shifted = compensate_for_system_time_change(&mut self.queue, &objects, change);
        eprintln!(
            "[VGL-EVENTS] system clock moved {} by {}s; shifted {shifted} events",
            if change.is_backwards() { "backwards" } else { "forwards" },
            change.difference()
        );
        self.logger.send(ActivityEvent::TimeChange {
            backwards: change.is_backwards(),
            difference_secs: change.difference(),
        });
        self.last_time = current;
        Ok(())
    }

    fn program_shutdown(&mut self) -> Result<()> {
        self.signals.request_shutdown();
        Ok(())
    }

    fn program_restart(&mut self) -> Result<()> {
        self.signals.request_restart();
        Ok(())
    }
}

fn clear_acknowledgement(object: &dyn Checkable) {
    {
        let mut st = object.status().lock();
        st.acknowledged = false;
        st.acknowledgement_expires = None;
    }
    object.update_status();
}

// ──────────────────── tests ────────────────────
