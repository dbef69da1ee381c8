//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use vigil::prelude::*;
//! ```

// Core
pub use crate::core::clock::{Timestamp, Timeval};
pub use crate::core::config::Config;
pub use crate::core::errors::{Result, VigilError};

// Objects
pub use crate::objects::registry::ObjectStore;
pub use crate::objects::{
    CheckStatus, Checkable, HostCheckable, HostId, HostState, ObjectRef, ObjectRegistry,
    ServiceId, ServiceState,
};

// Checks
pub use crate::checks::broker::{BrokerSink, BrokerVerdict, NullBroker};
pub use crate::checks::check_result::{CheckOptions, CheckResult, CheckSource, CheckType};
pub use crate::checks::checker::{Checker, CheckerSettings, ReapSummary};
pub use crate::checks::execution::{CommandBackend, CompletionSink, ExecutionResult};

// Events
pub use crate::events::queue::{EventHandle, EventQueue};
pub use crate::events::sched_info::SchedulingInfo;
pub use crate::events::timed_event::{EventKind, Priority, TimedEvent};

// Engine
#[cfg(feature = "daemon")]
pub use crate::daemon::loop_main::{Engine, EngineParts, StopReason, Tick};
#[cfg(feature = "daemon")]
pub use crate::daemon::signals::SignalHandler;
