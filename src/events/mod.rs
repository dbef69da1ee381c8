//! Timed events: the two-tier queue, initial scheduling, auto-rescheduling
//! and clock-jump compensation.

pub mod adjust;
pub mod dispatch;
mod index;
pub mod queue;
pub mod sched_info;
pub mod time_change;
pub mod timed_event;
