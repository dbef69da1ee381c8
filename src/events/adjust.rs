//! Auto-rescheduling: re-spread the checks queued in the next window.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::sync::Arc;

use crate::core::clock::Timestamp;
use crate::events::queue::{EventHandle, EventQueue};
use crate::events::timed_event::{EventKind, Priority};
use crate::objects::{Checkable, ObjectRegistry};

/// Projected serial cost of dispatching one host check, in seconds.
pub const HOST_CHECK_OVERHEAD: f64 = 0.1;
/// Projected serial cost of dispatching one service check, in seconds.
pub const SERVICE_CHECK_OVERHEAD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Adjustment {
    /// Checks counted inside the window.
    pub checks: usize,
    /// Whether any check started before the previous one's overhead elapsed.
    pub bumped: bool,
    /// Checks moved. Zero when nothing bumped.
    pub moved: usize,
    pub inter_check_delay: f64,
    pub exec_time_factor: f64,
}

enum Target {
    Host(Arc<dyn Checkable>),
    Service(Arc<dyn Checkable>),
}

/// Low-tier checks in `(now, now + window]`, skipping forced checks and
/// events whose object is gone.
fn window_checks(
    queue: &EventQueue,
    registry: &dyn ObjectRegistry,
    now: Timestamp,
    window: u64,
) -> Vec<(EventHandle, Timestamp, Target)> {
    let last = now.saturating_add(i64::try_from(window).unwrap_or(i64::MAX));
    let mut found = Vec::new();
    for (handle, event) in queue.iter(Priority::Low) {
        if event.run_time <= now {
            continue;
        }
        if event.run_time > last {
            break;
        }
        let target = match event.kind {
            EventKind::HostCheck { host } => match registry.host(host) {
                Some(h) => Target::Host(h as Arc<dyn Checkable>),
                None => continue,
            },
            EventKind::ServiceCheck { service } => match registry.service(service) {
                Some(s) => Target::Service(s),
                None => continue,
            },
            _ => continue,
        };
        let forced = match &target {
            Target::Host(o) | Target::Service(o) => o.status().lock().check_options.is_forced(),
        };
        if !forced {
            found.push((handle, event.run_time, target));
        }
    }
    found
}

/// Smooth clustered checks across the next `window` seconds.
///
/// Only a fixed dispatch overhead per check is assumed to serialize, since
/// checks run in parallel. If no check bumps into its predecessor the queue
/// is left untouched. Otherwise checks are laid out from `now`, half an
/// inter-check delay first, then one delay plus one overhead apart, scaled
/// down when the overhead alone overflows the window. Owners get the new
/// `next_check` and the low tier is re-sorted once at the end.
pub fn adjust_check_scheduling(
    queue: &mut EventQueue,
    registry: &dyn ObjectRegistry,
    window: u64,
    now: Timestamp,
) -> Adjustment {
    let checks = window_checks(queue, registry, now, window);
    let mut outcome = Adjustment {
        checks: checks.len(),
        ..Adjustment::default()
    };

    let mut last_time: Timestamp = 0;
    let mut last_overhead = 0.0;
    let mut total = 0.0;
    for (_, run_time, target) in &checks {
        if last_time as f64 + last_overhead > *run_time as f64 {
            outcome.bumped = true;
        }
        last_time = *run_time;
        last_overhead = match target {
            Target::Host(_) => HOST_CHECK_OVERHEAD,
            Target::Service(_) => SERVICE_CHECK_OVERHEAD,
        };
        total += last_overhead;
    }

    if checks.is_empty() || !outcome.bumped {
        return outcome;
    }

    let window_f = window as f64;
    if total as u64 > window {
        outcome.inter_check_delay = 0.0;
        outcome.exec_time_factor = window_f / total;
    } else {
        outcome.inter_check_delay = (window_f - total) / checks.len() as f64;
        outcome.exec_time_factor = 1.0;
    }

    let mut icd_offset = outcome.inter_check_delay / 2.0;
    let mut exec_offset = 0.0;
    let mut changes = Vec::with_capacity(checks.len());
    for (handle, _, target) in &checks {
        let (object, exec_time) = match target {
            Target::Host(h) => {
                let executed = h.status().lock().execution_time;
                (h, (executed + HOST_CHECK_OVERHEAD) * outcome.exec_time_factor)
            }
            Target::Service(s) => (s, SERVICE_CHECK_OVERHEAD * outcome.exec_time_factor),
        };
        let new_run = now.saturating_add((exec_offset + icd_offset) as i64);
        object.status().lock().next_check = new_run;
        object.update_status();
        changes.push((*handle, new_run));

        icd_offset += outcome.inter_check_delay;
        exec_offset += exec_time;
    }

    outcome.moved = changes.len();
    queue.retime(Priority::Low, &changes);
    outcome
}
