//! System clock jump compensation.

use std::sync::Arc;

use crate::core::clock::Timestamp;
use crate::events::queue::{EventHandle, EventQueue};
use crate::events::timed_event::Priority;
use crate::objects::Checkable;

/// A detected wall-clock jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeChange {
    pub last: Timestamp,
    pub current: Timestamp,
}

impl TimeChange {
    #[must_use]
    pub const fn new(last: Timestamp, current: Timestamp) -> Self {
        Self { last, current }
    }

    #[must_use]
    pub const fn is_backwards(&self) -> bool {
        self.last > self.current
    }

    #[must_use]
    pub const fn difference(&self) -> u64 {
        self.last.abs_diff(self.current)
    }

    /// Shift one timestamp by the jump. Zero means "never" and stays zero;
    /// a backwards shift never goes below the epoch.
    #[must_use]
    pub fn adjust(&self, ts: Timestamp) -> Timestamp {
        adjust_timestamp_for_time_change(self.last, self.current, self.difference(), ts)
    }
}

/// Shift `ts` by `difference` seconds in the direction `last -> current`.
#[must_use]
pub fn adjust_timestamp_for_time_change(
    last: Timestamp,
    current: Timestamp,
    difference: u64,
    ts: Timestamp,
) -> Timestamp {
    if ts == 0 {
        return ts;
    }
    let diff = i64::try_from(difference).unwrap_or(i64::MAX);
    if last > current {
        ts.saturating_sub(diff).max(0)
    } else {
        ts.saturating_add(diff)
    }
}

/// Shift every compensating event in both tiers and every object's
/// timestamps. Both tiers are re-sorted before this returns, so nothing is
/// evaluated in a half-shifted state.
pub fn compensate_for_system_time_change(
    queue: &mut EventQueue,
    objects: &[Arc<dyn Checkable>],
    change: TimeChange,
) -> usize {
    let mut shifted = 0;
    for priority in Priority::ALL {
        let changes: Vec<(EventHandle, Timestamp)> = queue
            .iter(priority)
            .filter(|(_, ev)| ev.compensate_for_time_change)
            .map(|(h, ev)| (h, change.adjust(ev.run_time)))
            .collect();
        shifted += changes.len();
        queue.retime(priority, &changes);
    }

    for object in objects {
        {
            let mut st = object.status().lock();
            st.last_check = change.adjust(st.last_check);
            st.next_check = change.adjust(st.next_check);
            st.last_state_change = change.adjust(st.last_state_change);
            st.last_hard_state_change = change.adjust(st.last_hard_state_change);
            st.acknowledgement_expires = st.acknowledgement_expires.map(|t| change.adjust(t));
        }
        object.update_status();
    }
    shifted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::HostDefinition;
    use crate::events::timed_event::{EventKind, TimedEvent};
    use crate::objects::HostId;
    use crate::objects::host::Host;
    use crate::objects::registry::RescheduleRequests;

    #[test]
    fn epoch_values_are_left_alone() {
        assert_eq!(adjust_timestamp_for_time_change(100, 50, 50, 0), 0);
        assert_eq!(adjust_timestamp_for_time_change(50, 100, 50, 0), 0);
    }

    #[test]
    fn backwards_shift_clamps_at_epoch() {
        assert_eq!(adjust_timestamp_for_time_change(1_000, 400, 600, 900), 300);
        assert_eq!(adjust_timestamp_for_time_change(1_000, 400, 600, 500), 0);
    }

    #[test]
    fn forwards_shift_adds() {
        let change = TimeChange::new(1_000, 4_600);
        assert!(!change.is_backwards());
        assert_eq!(change.difference(), 3_600);
        assert_eq!(change.adjust(1_200), 4_800);
    }

    #[test]
    fn compensation_shifts_events_and_objects() {
        let mut queue = EventQueue::new();
        let check = queue.schedule(
            TimedEvent::once(EventKind::HostCheck { host: HostId(1) }, 1_500).compensated(true),
            Priority::Low,
        );
        let fixed = queue.schedule(
            TimedEvent::once(EventKind::ProgramShutdown, 1_600),
            Priority::High,
        );
        let recurring = queue.schedule(
            TimedEvent::every(EventKind::RescheduleChecks, 1_700, 60),
            Priority::High,
        );

        let host: Arc<dyn Checkable> = Arc::new(Host::new(
            HostId(1),
            &HostDefinition {
                name: "web1".to_string(),
                ..HostDefinition::default()
            },
            60,
            false,
            Arc::new(RescheduleRequests::default()),
        ));
        host.status().lock().next_check = 1_500;

        let shifted =
            compensate_for_system_time_change(&mut queue, &[host.clone()], TimeChange::new(2_000, 1_000));
        assert_eq!(shifted, 2);
        assert_eq!(queue.get(check).map(|e| e.run_time), Some(500));
        assert_eq!(queue.get(fixed).map(|e| e.run_time), Some(1_600));
        assert_eq!(queue.get(recurring).map(|e| e.run_time), Some(700));
        let st = host.status().lock();
        assert_eq!(st.next_check, 500);
        assert_eq!(st.last_check, 0);
    }
}
