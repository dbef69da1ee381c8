//! Startup scheduling parameters and the projected scheduling report.
//!
//! [`SchedulingInfo::compute`] counts the population and derives the
//! inter-check delays and the service interleave factor. The `plan_*`
//! methods then spread the first checks over time: hosts one delay apart,
//! services in interleaved blocks so that checks of one host do not land
//! back to back.

#![allow(missing_docs)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::checks::check_result::CheckOptions;
use crate::core::clock::Timestamp;
use crate::core::config::{Config, InterCheckDelay, InterleaveFactor, SchedulingConfig};
use crate::events::queue::{EventHandle, EventQueue};
use crate::events::timed_event::{EventKind, Priority, TimedEvent};
use crate::objects::{Checkable, ObjectRef};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulingInfo {
    pub total_hosts: usize,
    pub total_scheduled_hosts: usize,
    pub total_services: usize,
    pub total_scheduled_services: usize,
    pub average_services_per_host: f64,
    pub average_scheduled_services_per_host: f64,
    /// Seconds, already multiplied by the interval length.
    pub host_check_interval_total: u64,
    pub service_check_interval_total: u64,
    pub average_host_check_interval: f64,
    pub average_service_check_interval: f64,
    pub average_service_execution_time: f64,
    pub average_host_inter_check_delay: f64,
    pub average_service_inter_check_delay: f64,
    pub host_inter_check_delay: f64,
    pub service_inter_check_delay: f64,
    pub service_interleave_factor: u32,
    pub max_host_check_spread: u64,
    pub max_service_check_spread: u64,
    pub first_host_check: Timestamp,
    pub last_host_check: Timestamp,
    pub first_service_check: Timestamp,
    pub last_service_check: Timestamp,
}

/// Whether an object takes part in regular scheduling. Marks the object.
fn qualifies(object: &dyn Checkable, now: Timestamp) -> bool {
    let viable = object
        .verify_check_viability(CheckOptions::NONE, now)
        .viable;
    let mut st = object.status().lock();
    let schedule = st.check_interval > 0 && st.checks_enabled && viable;
    st.should_be_scheduled = schedule;
    schedule
}

fn delay_for(
    method: InterCheckDelay,
    average_interval: f64,
    scheduled: usize,
    spread_minutes: u64,
) -> (f64, f64) {
    match method {
        InterCheckDelay::None => (0.0, 0.0),
        InterCheckDelay::Dumb => (0.0, 1.0),
        InterCheckDelay::User(value) => (0.0, value),
        InterCheckDelay::Smart if scheduled > 0 && average_interval > 0.0 => {
            let average = average_interval / scheduled as f64;
            let cap = (spread_minutes as f64 * 60.0) / scheduled as f64;
            (average, average.min(cap))
        }
        InterCheckDelay::Smart => (0.0, 0.0),
    }
}

fn offset(now: Timestamp, mult: u64, delay: f64) -> Timestamp {
    now.saturating_add((mult as f64 * delay) as i64)
}

impl SchedulingInfo {
    /// Count objects and derive delays. Objects that should not be
    /// scheduled get `should_be_scheduled = false`.
    pub fn compute(
        config: &SchedulingConfig,
        hosts: &[Arc<dyn Checkable>],
        services: &[Arc<dyn Checkable>],
        now: Timestamp,
    ) -> Self {
        let mut info = Self {
            total_hosts: hosts.len(),
            total_services: services.len(),
            max_host_check_spread: config.max_host_check_spread_minutes,
            max_service_check_spread: config.max_service_check_spread_minutes,
            ..Self::default()
        };

        let mut service_intervals = 0u64;
        for svc in services {
            if !qualifies(svc.as_ref(), now) {
                continue;
            }
            info.total_scheduled_services += 1;
            let st = svc.status().lock();
            service_intervals += st.check_interval;
            let n = info.total_scheduled_services as f64;
            info.average_service_execution_time =
                info.average_service_execution_time.mul_add(n - 1.0, st.execution_time) / n;
        }

        let mut host_intervals = 0u64;
        for host in hosts {
            if qualifies(host.as_ref(), now) {
                info.total_scheduled_hosts += 1;
                host_intervals += host.status().lock().check_interval;
            }
        }

        let host_count = info.total_hosts.max(1) as f64;
        info.average_services_per_host = info.total_services as f64 / host_count;
        info.average_scheduled_services_per_host =
            info.total_scheduled_services as f64 / host_count;

        info.service_check_interval_total =
            service_intervals.saturating_mul(config.interval_length_secs);
        info.host_check_interval_total = host_intervals.saturating_mul(config.interval_length_secs);
        if info.total_scheduled_services > 0 {
            info.average_service_check_interval =
                info.service_check_interval_total as f64 / info.total_scheduled_services as f64;
        }
        if info.total_scheduled_hosts > 0 {
            info.average_host_check_interval =
                info.host_check_interval_total as f64 / info.total_scheduled_hosts as f64;
        }

        (
            info.average_service_inter_check_delay,
            info.service_inter_check_delay,
        ) = delay_for(
            config.service_inter_check_delay,
            info.average_service_check_interval,
            info.total_scheduled_services,
            config.max_service_check_spread_minutes,
        );
        (info.average_host_inter_check_delay, info.host_inter_check_delay) = delay_for(
            config.host_inter_check_delay,
            info.average_host_check_interval,
            info.total_scheduled_hosts,
            config.max_host_check_spread_minutes,
        );

        info.service_interleave_factor = match config.service_interleave_factor {
            InterleaveFactor::User(factor) => factor,
            InterleaveFactor::Smart => info.average_scheduled_services_per_host.ceil() as u32,
        };
        info
    }

    /// Interleave blocks the scheduled services are divided into.
    #[must_use]
    pub fn total_interleave_blocks(&self) -> u64 {
        let scheduled = self.total_scheduled_services as u64;
        if self.service_interleave_factor == 0 {
            scheduled
        } else {
            scheduled.div_ceil(u64::from(self.service_interleave_factor))
        }
    }

    /// Assign first check times to services, block by block.
    ///
    /// Within block `b`, the `i`-th schedulable service (counting from 1)
    /// runs at `now + (b + i * total_blocks) * service_icd`. Services
    /// already due in the future keep their time.
    pub fn plan_initial_service_checks(
        &mut self,
        services: &[Arc<dyn Checkable>],
        now: Timestamp,
    ) -> Vec<(ObjectRef, Timestamp)> {
        let factor = u64::from(self.service_interleave_factor);
        let total_blocks = self.total_interleave_blocks();
        self.first_service_check = 0;
        self.last_service_check = 0;
        let mut planned = Vec::new();
        let mut remaining = services.iter();
        let mut block = 0u64;
        let mut exhausted = factor == 0;

        while !exhausted {
            let mut index = 0u64;
            while index < factor {
                let Some(svc) = remaining.next() else {
                    exhausted = true;
                    break;
                };
                let mut st = svc.status().lock();
                if !st.should_be_scheduled || st.next_check > now {
                    continue;
                }
                index += 1;
                let next = offset(now, block + index * total_blocks, self.service_inter_check_delay);
                st.next_check = next;
                drop(st);
                planned.push((svc.object(), next));
                if self.first_service_check == 0 || next < self.first_service_check {
                    self.first_service_check = next;
                }
                self.last_service_check = self.last_service_check.max(next);
            }
            block += 1;
        }
        planned
    }

    /// Assign first check times to hosts, one host delay apart.
    pub fn plan_initial_host_checks(
        &mut self,
        hosts: &[Arc<dyn Checkable>],
        now: Timestamp,
    ) -> Vec<(ObjectRef, Timestamp)> {
        self.first_host_check = 0;
        self.last_host_check = 0;
        let mut planned = Vec::new();
        let mut mult = 0u64;
        for host in hosts {
            let mut st = host.status().lock();
            if !st.should_be_scheduled || st.next_check > now {
                continue;
            }
            let next = offset(now, mult, self.host_inter_check_delay);
            st.next_check = next;
            drop(st);
            planned.push((host.object(), next));
            if self.first_host_check == 0 || next < self.first_host_check {
                self.first_host_check = next;
            }
            self.last_host_check = self.last_host_check.max(next);
            mult += 1;
        }
        planned
    }

    /// Human-readable projection for `config`.
    #[must_use]
    pub const fn report<'a>(&'a self, config: &'a Config) -> SchedulingReport<'a> {
        SchedulingReport { info: self, config }
    }

    /// Tuning hints; empty when nothing looks off.
    #[must_use]
    pub fn suggestions(&self, config: &Config) -> Vec<String> {
        let reaper = config.reaper.check_reaper_interval_secs as f64;
        let mut hints = Vec::new();

        // Keep at most ~2000 queued results assuming a 2x burst.
        let max_reaper = (2000.0 * self.service_inter_check_delay).floor().clamp(2.0, 30.0);
        if max_reaper < reaper {
            hints.push(format!(
                "check_reaper_interval_secs should be <= {} seconds",
                max_reaper as u64
            ));
        }
        if config.reaper.check_reaper_interval_secs < 2 {
            hints.push("check_reaper_interval_secs should be >= 2 seconds".to_string());
        }

        let burst = if self.service_inter_check_delay == 0.0 {
            (reaper * 2.0).ceil()
        } else {
            (reaper * 2.0 / self.service_inter_check_delay).ceil()
        };
        let sustained = if self.average_service_check_interval > 0.0 {
            (self.total_scheduled_services as f64 / self.average_service_check_interval
                * 1.25
                * reaper
                * self.average_service_execution_time)
                .ceil()
        } else {
            0.0
        };
        let minimum = burst.max(sustained);
        let configured = config.checks.max_parallel_service_checks;
        if configured != 0 && minimum > configured as f64 {
            hints.push(format!(
                "max_parallel_service_checks should be >= {}",
                minimum as u64
            ));
        }
        hints
    }
}

/// Queue a check event for every object that should be scheduled, at its
/// `next_check`. Objects outside regular scheduling are still queued when a
/// forced check was pending for them.
pub fn schedule_initial_checks(
    queue: &mut EventQueue,
    objects: &[Arc<dyn Checkable>],
) -> Vec<EventHandle> {
    let mut handles = Vec::with_capacity(objects.len());
    for object in objects {
        let (run_time, options) = {
            let st = object.status().lock();
            let forced_pending =
                !st.checks_enabled && st.next_check != 0 && st.check_options.is_forced();
            if !st.should_be_scheduled && !forced_pending {
                continue;
            }
            (st.next_check, st.check_options)
        };
        object.update_status();
        let kind = match object.object() {
            ObjectRef::Host(host) => EventKind::HostCheck { host },
            ObjectRef::Service(service) => EventKind::ServiceCheck { service },
        };
        let event = TimedEvent::once(kind, run_time)
            .compensated(true)
            .with_options(options);
        handles.push(queue.schedule(event, Priority::Low));
    }
    handles
}

pub struct SchedulingReport<'a> {
    info: &'a SchedulingInfo,
    config: &'a Config,
}

fn method_label(method: InterCheckDelay) -> &'static str {
    match method {
        InterCheckDelay::None => "NONE",
        InterCheckDelay::Dumb => "DUMB",
        InterCheckDelay::Smart => "SMART",
        InterCheckDelay::User(_) => "USER-SUPPLIED VALUE",
    }
}

fn when(ts: Timestamp, any: bool) -> String {
    if !any {
        return "N/A".to_string();
    }
    chrono::DateTime::from_timestamp(ts, 0).map_or_else(
        || ts.to_string(),
        |t| t.format("%a %b %e %H:%M:%S %Y").to_string(),
    )
}

impl fmt::Display for SchedulingReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info;
        let sched = &self.config.scheduling;

        writeln!(f, "HOST SCHEDULING INFORMATION")?;
        writeln!(f, "---------------------------")?;
        writeln!(f, "Total hosts:                        {}", info.total_hosts)?;
        writeln!(f, "Total scheduled hosts:              {}", info.total_scheduled_hosts)?;
        writeln!(
            f,
            "Host inter-check delay method:      {}",
            method_label(sched.host_inter_check_delay)
        )?;
        if sched.host_inter_check_delay == InterCheckDelay::Smart {
            writeln!(
                f,
                "Average host check interval:        {:.2} sec",
                info.average_host_check_interval
            )?;
        }
        writeln!(f, "Host inter-check delay:             {:.2} sec", info.host_inter_check_delay)?;
        writeln!(f, "Max host check spread:              {} min", info.max_host_check_spread)?;
        let any_hosts = info.total_scheduled_hosts > 0;
        writeln!(f, "First scheduled check:              {}", when(info.first_host_check, any_hosts))?;
        writeln!(f, "Last scheduled check:               {}", when(info.last_host_check, any_hosts))?;
        writeln!(f)?;

        writeln!(f, "SERVICE SCHEDULING INFORMATION")?;
        writeln!(f, "-------------------------------")?;
        writeln!(f, "Total services:                     {}", info.total_services)?;
        writeln!(f, "Total scheduled services:           {}", info.total_scheduled_services)?;
        writeln!(
            f,
            "Service inter-check delay method:   {}",
            method_label(sched.service_inter_check_delay)
        )?;
        if sched.service_inter_check_delay == InterCheckDelay::Smart {
            writeln!(
                f,
                "Average service check interval:     {:.2} sec",
                info.average_service_check_interval
            )?;
        }
        writeln!(f, "Inter-check delay:                  {:.2} sec", info.service_inter_check_delay)?;
        match sched.service_interleave_factor {
            InterleaveFactor::User(_) => {
                writeln!(f, "Interleave factor method:           USER-SUPPLIED VALUE")?;
            }
            InterleaveFactor::Smart => {
                writeln!(f, "Interleave factor method:           SMART")?;
                writeln!(
                    f,
                    "Average services per host:          {:.2}",
                    info.average_services_per_host
                )?;
            }
        }
        writeln!(f, "Service interleave factor:          {}", info.service_interleave_factor)?;
        writeln!(f, "Max service check spread:           {} min", info.max_service_check_spread)?;
        let any_services = info.total_scheduled_services > 0;
        writeln!(
            f,
            "First scheduled check:              {}",
            when(info.first_service_check, any_services)
        )?;
        writeln!(
            f,
            "Last scheduled check:               {}",
            when(info.last_service_check, any_services)
        )?;
        writeln!(f)?;

        writeln!(f, "CHECK PROCESSING INFORMATION")?;
        writeln!(f, "----------------------------")?;
        writeln!(
            f,
            "Check result reaper interval:       {} sec",
            self.config.reaper.check_reaper_interval_secs
        )?;
        match self.config.checks.max_parallel_service_checks {
            0 => writeln!(f, "Max concurrent service checks:      Unlimited")?,
            n => writeln!(f, "Max concurrent service checks:      {n}")?,
        }
        writeln!(f)?;

        writeln!(f, "PERFORMANCE SUGGESTIONS")?;
        writeln!(f, "-----------------------")?;
        let hints = info.suggestions(self.config);
        if hints.is_empty() {
            writeln!(f, "No suggestions, things look okay.")?;
        }
        for hint in hints {
            writeln!(f, "* {hint}")?;
        }
        Ok(())
    }
}
