//! Monitored objects as the scheduler sees them.
//!
//! The scheduler and checker never reach into host or service business
//! rules. They go through [`Checkable`] (one object that can be checked),
//! [`HostCheckable`] (the synchronous host path) and [`ObjectRegistry`]
//! (identity lookups). [`registry::ObjectStore`] is a small in-memory
//! implementation used by the engine and by tests.

#![allow(missing_docs)]

pub mod host;
pub mod output;
pub mod registry;
pub mod service;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::checks::check_result::{CheckOptions, CheckResult, CheckType};
use crate::checks::command::Macros;
use crate::core::clock::Timestamp;
use crate::core::errors::Result;

/// Host identity. Zero means "unresolved".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub u64);

impl HostId {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Service identity, unique across all hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub u64);

/// Which object a check, event, or reschedule request is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectRef {
    Host(HostId),
    Service(ServiceId),
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(id) => write!(f, "host#{}", id.0),
            Self::Service(id) => write!(f, "service#{}", id.0),
        }
    }
}

/// Plugin return codes.
pub const STATE_OK: i32 = 0;
pub const STATE_WARNING: i32 = 1;
pub const STATE_CRITICAL: i32 = 2;
pub const STATE_UNKNOWN: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostState {
    Up,
    Down,
    Unreachable,
}

impl HostState {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Up => 0,
            Self::Down => 1,
            Self::Unreachable => 2,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Up,
            2 => Self::Unreachable,
            _ => Self::Down,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Unreachable => "UNREACHABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl ServiceState {
    #[must_use]
    pub const fn from_return_code(code: i32) -> Self {
        match code {
            STATE_OK => Self::Ok,
            STATE_WARNING => Self::Warning,
            STATE_CRITICAL => Self::Critical,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => STATE_OK,
            Self::Warning => STATE_WARNING,
            Self::Critical => STATE_CRITICAL,
            Self::Unknown => STATE_UNKNOWN,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateType {
    Soft,
    Hard,
}

/// Answer to "may this object be checked now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viability {
    pub viable: bool,
    pub preferred_time: Option<Timestamp>,
}

impl Viability {
    pub const VIABLE: Self = Self {
        viable: true,
        preferred_time: None,
    };

    #[must_use]
    pub const fn retry_at(time: Timestamp) -> Self {
        Self {
            viable: false,
            preferred_time: Some(time),
        }
    }
}

/// Mutable check bookkeeping every checkable carries.
///
/// `is_executing` is set by the checker before submission and cleared by
/// whoever applies the result; at most one active check per object is in
/// flight unless execution is forced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckStatus {
    pub checks_enabled: bool,
    pub is_executing: bool,
    pub check_options: CheckOptions,
    pub check_type: CheckType,
    pub latency: f64,
    pub execution_time: f64,
    pub has_been_checked: bool,
    pub should_be_scheduled: bool,
    pub last_check: Timestamp,
    pub next_check: Timestamp,
    pub last_state_change: Timestamp,
    pub last_hard_state_change: Timestamp,
    /// Raw state code: [`HostState::code`] for hosts, [`ServiceState::code`] for services.
    pub current_state: i32,
    pub last_state: i32,
    pub state_type: StateType,
    pub current_attempt: u32,
    pub max_attempts: u32,
    /// In interval-length units.
    pub check_interval: u64,
    pub retry_interval: u64,
    pub plugin_output: String,
    pub long_plugin_output: String,
    pub perf_data: String,
    pub acknowledged: bool,
    pub acknowledgement_expires: Option<Timestamp>,
}

impl CheckStatus {
    #[must_use]
    pub fn new(check_interval: u64, retry_interval: u64, max_attempts: u32, checks_enabled: bool) -> Self {
        Self {
            checks_enabled,
            is_executing: false,
            check_options: CheckOptions::NONE,
            check_type: CheckType::Active,
            latency: 0.0,
            execution_time: 0.0,
            has_been_checked: false,
            should_be_scheduled: true,
            last_check: 0,
            next_check: 0,
            last_state_change: 0,
            last_hard_state_change: 0,
            current_state: 0,
            last_state: 0,
            state_type: StateType::Hard,
            current_attempt: 1,
            max_attempts,
            check_interval,
            retry_interval,
            plugin_output: String::new(),
            long_plugin_output: String::new(),
            perf_data: String::new(),
            acknowledged: false,
            acknowledgement_expires: None,
        }
    }

    /// Soft non-OK objects are checked at the retry interval.
    #[must_use]
    pub const fn effective_interval(&self) -> u64 {
        if matches!(self.state_type, StateType::Soft) && self.current_state != 0 {
            self.retry_interval
        } else {
            self.check_interval
        }
    }

    /// Track soft/hard attempts for a fresh state; returns true on a state change.
    pub fn record_state(&mut self, new_state: i32, at: Timestamp) -> bool {
        self.last_state = self.current_state;
        let changed = self.current_state != new_state;
        let was_soft = self.state_type == StateType::Soft;

        if new_state == 0 {
            if changed {
                self.last_hard_state_change = at;
            }
            self.current_attempt = 1;
            self.state_type = StateType::Hard;
        } else {
            if self.current_state == 0 && self.state_type == StateType::Hard {
                self.current_attempt = 1;
            } else if self.current_attempt < self.max_attempts {
                self.current_attempt += 1;
            }
            self.state_type = if self.current_attempt >= self.max_attempts {
                StateType::Hard
            } else {
                StateType::Soft
            };
            if self.state_type == StateType::Hard && (changed || was_soft) {
                self.last_hard_state_change = at;
            }
        }

        if changed {
            self.last_state_change = at;
        }
        self.current_state = new_state;
        changed
    }
}

/// Anything that can be the subject of a check.
pub trait Checkable: Send + Sync {
    fn object(&self) -> ObjectRef;

    /// Owning host; the host itself for host checks.
    fn host_id(&self) -> HostId;

    fn name(&self) -> String;

    /// `command_name!arg1!arg2`, if configured.
    fn check_command(&self) -> Option<&str>;

    fn status(&self) -> &Mutex<CheckStatus>;

    /// Macros available to this object's check command.
    fn macros(&self) -> Macros;

    fn verify_check_viability(&self, options: CheckOptions, now: Timestamp) -> Viability;

    /// Apply a reaped result. Fails with a domain error on results that
    /// do not belong to this object.
    fn handle_async_check_result(&self, result: &CheckResult) -> Result<()>;

    /// Publish the current status to observers.
    fn update_status(&self) {}
}

/// Hosts additionally support the blocking on-demand path.
pub trait HostCheckable: Checkable {
    /// Fold a synchronously obtained state into the host's state machine.
    fn process_check_result_3x(
        &self,
        new_state: HostState,
        old_plugin_output: &str,
        options: CheckOptions,
        now: Timestamp,
    ) -> Result<HostState>;
}

/// Identity lookups the checker and file queue need.
pub trait ObjectRegistry: Send + Sync {
    fn host(&self, id: HostId) -> Option<Arc<dyn HostCheckable>>;

    fn service(&self, id: ServiceId) -> Option<Arc<dyn Checkable>>;

    fn find_host_id(&self, name: &str) -> Option<HostId>;

    fn find_service_id(&self, host: HostId, description: &str) -> Option<ServiceId>;

    fn checkable(&self, object: ObjectRef) -> Option<Arc<dyn Checkable>> {
        match object {
            ObjectRef::Host(id) => self.host(id).map(|host| host as Arc<dyn Checkable>),
            ObjectRef::Service(id) => self.service(id),
        }
    }
}
