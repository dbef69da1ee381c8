//! Scheduled event values.

#![allow(missing_docs)]

use std::fmt;

use serde::Serialize;

use crate::checks::check_result::CheckOptions;
use crate::core::clock::Timestamp;
use crate::objects::{HostId, ObjectRef, ServiceId};

/// Which of the two independently ordered lists an event lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Ordinary checks.
    Low,
    /// Housekeeping that must run promptly: reaper, ack expiry, compensation.
    High,
}

impl Priority {
    pub const ALL: [Self; 2] = [Self::High, Self::Low];

    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::Low => 0,
            Self::High => 1,
        }
    }
}

/// What happens when an event fires. Every variant that targets an object
/// carries its typed identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    ServiceCheck { service: ServiceId },
    HostCheck { host: HostId },
    ExpireServiceAck { service: ServiceId },
    ExpireHostAck { host: HostId },
    CheckReaper,
    RescheduleChecks,
    CompensateTimeChange { last: Timestamp, current: Timestamp },
    ProgramShutdown,
    ProgramRestart,
}

impl EventKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ServiceCheck { .. } => "EVENT_SERVICE_CHECK",
            Self::HostCheck { .. } => "EVENT_HOST_CHECK",
            Self::ExpireServiceAck { .. } => "EVENT_EXPIRE_SERVICE_ACK",
            Self::ExpireHostAck { .. } => "EVENT_EXPIRE_HOST_ACK",
            Self::CheckReaper => "EVENT_CHECK_REAPER",
            Self::RescheduleChecks => "EVENT_RESCHEDULE_CHECKS",
            Self::CompensateTimeChange { .. } => "EVENT_TIME_CHANGE",
            Self::ProgramShutdown => "EVENT_PROGRAM_SHUTDOWN",
            Self::ProgramRestart => "EVENT_PROGRAM_RESTART",
        }
    }

    /// Object this event acts on, if any.
    #[must_use]
    pub const fn target(&self) -> Option<ObjectRef> {
        match *self {
            Self::ServiceCheck { service } | Self::ExpireServiceAck { service } => {
                Some(ObjectRef::Service(service))
            }
            Self::HostCheck { host } | Self::ExpireHostAck { host } => Some(ObjectRef::Host(host)),
            _ => None,
        }
    }

    /// Index slot for kinds that are looked up by owner.
    #[must_use]
    pub const fn indexed(&self) -> Option<(IndexedKind, u64)> {
        match *self {
            Self::ServiceCheck { service } => Some((IndexedKind::ServiceCheck, service.0)),
            Self::HostCheck { host } => Some((IndexedKind::HostCheck, host.0)),
            Self::ExpireServiceAck { service } => Some((IndexedKind::ServiceAckExpiry, service.0)),
            Self::ExpireHostAck { host } => Some((IndexedKind::HostAckExpiry, host.0)),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_check(&self) -> bool {
        matches!(self, Self::ServiceCheck { .. } | Self::HostCheck { .. })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(target) => write!(f, "{}({target})", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

/// The event kinds the identity index tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexedKind {
    ServiceCheck,
    HostCheck,
    ServiceAckExpiry,
    HostAckExpiry,
}

impl IndexedKind {
    pub const ALL: [Self; 4] = [
        Self::ServiceCheck,
        Self::HostCheck,
        Self::ServiceAckExpiry,
        Self::HostAckExpiry,
    ];

    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::ServiceCheck => 0,
            Self::HostCheck => 1,
            Self::ServiceAckExpiry => 2,
            Self::HostAckExpiry => 3,
        }
    }
}

/// A scheduled event.
#[derive(Debug, Clone, Serialize)]
pub struct TimedEvent {
    pub kind: EventKind,
    pub run_time: Timestamp,
    pub recurring: bool,
    /// Seconds between runs when recurring.
    pub interval: u64,
    pub compensate_for_time_change: bool,
    pub options: CheckOptions,
}

impl TimedEvent {
    /// One-shot event.
    #[must_use]
    pub const fn once(kind: EventKind, run_time: Timestamp) -> Self {
        Self {
            kind,
            run_time,
            recurring: false,
            interval: 0,
            compensate_for_time_change: false,
            options: CheckOptions::NONE,
        }
    }

    /// Recurring event firing every `interval` seconds.
    #[must_use]
    pub const fn every(kind: EventKind, run_time: Timestamp, interval: u64) -> Self {
        Self {
            kind,
            run_time,
            recurring: true,
            interval,
            compensate_for_time_change: true,
            options: CheckOptions::NONE,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: CheckOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn compensated(mut self, compensate: bool) -> Self {
        self.compensate_for_time_change = compensate;
        self
    }

    /// Next run time of a recurring event: one interval later, never
    /// earlier than `now`.
    #[must_use]
    pub fn next_run_time(&self, now: Timestamp) -> Timestamp {
        let step = i64::try_from(self.interval).unwrap_or(i64::MAX);
        self.run_time.saturating_add(step).max(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable() {
        let kind = EventKind::HostCheck { host: HostId(3) };
        assert_eq!(kind.name(), "EVENT_HOST_CHECK");
        assert_eq!(kind.to_string(), "EVENT_HOST_CHECK(host#3)");
        assert_eq!(EventKind::CheckReaper.to_string(), "EVENT_CHECK_REAPER");
    }

    #[test]
    fn only_owner_kinds_are_indexed() {
        assert_eq!(
            EventKind::ServiceCheck {
                service: ServiceId(9)
            }
            .indexed(),
            Some((IndexedKind::ServiceCheck, 9))
        );
        assert_eq!(
            EventKind::ExpireHostAck { host: HostId(9) }.indexed(),
            Some((IndexedKind::HostAckExpiry, 9))
        );
        assert_eq!(EventKind::CheckReaper.indexed(), None);
        assert_eq!(
            EventKind::CompensateTimeChange {
                last: 1,
                current: 2
            }
            .indexed(),
            None
        );
    }

    #[test]
    fn recurring_next_run_time_is_clamped_to_now() {
        let ev = TimedEvent::every(EventKind::CheckReaper, 100, 10);
        assert_eq!(ev.next_run_time(50), 110);
        assert_eq!(ev.next_run_time(500), 500);
    }
}
