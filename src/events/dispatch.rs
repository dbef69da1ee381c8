//! Routing a fired event to the code that acts on it.

#![allow(missing_docs)]

use crate::core::clock::Timestamp;
use crate::core::errors::Result;
use crate::events::timed_event::{EventKind, TimedEvent};
use crate::objects::{HostId, ServiceId};

/// Callbacks for each event kind. The engine implements this; tests use
/// recorders.
pub trait EventHandler {
    /// `latency` is how late the event fired, in seconds.
    fn service_check(&mut self, service: ServiceId, event: &TimedEvent, latency: f64) -> Result<()>;

    fn host_check(&mut self, host: HostId, event: &TimedEvent, latency: f64) -> Result<()>;

    fn expire_service_ack(&mut self, service: ServiceId) -> Result<()>;

    fn expire_host_ack(&mut self, host: HostId) -> Result<()>;

    fn check_reaper(&mut self) -> Result<()>;

    fn reschedule_checks(&mut self) -> Result<()>;

    fn compensate_time_change(&mut self, last: Timestamp, current: Timestamp) -> Result<()>;

    fn program_shutdown(&mut self) -> Result<()>;

    fn program_restart(&mut self) -> Result<()>;
}

/// Run one event's handler.
#[allow(clippy::cast_precision_loss)]
pub fn handle_timed_event(
    handler: &mut dyn EventHandler,
    event: &TimedEvent,
    now: Timestamp,
) -> Result<()> {
    let latency = now.saturating_sub(event.run_time).max(0) as f64;
    match event.kind {
        EventKind::ServiceCheck { service } => handler.service_check(service, event, latency),
        EventKind::HostCheck { host } => handler.host_check(host, event, latency),
        EventKind::ExpireServiceAck { service } => handler.expire_service_ack(service),
        EventKind::ExpireHostAck { host } => handler.expire_host_ack(host),
        EventKind::CheckReaper => handler.check_reaper(),
        EventKind::RescheduleChecks => handler.reschedule_checks(),
        EventKind::CompensateTimeChange { last, current } => {
            handler.compensate_time_change(last, current)
        }
        EventKind::ProgramShutdown => handler.program_shutdown(),
        EventKind::ProgramRestart => handler.program_restart(),
    }
}
