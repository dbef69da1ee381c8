//! The value object carried from dispatch (or a result file) to the checkable.

#![allow(missing_docs)]

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::core::clock::Timeval;
use crate::objects::{HostId, ObjectRef, ServiceId, STATE_OK};

/// Host or service result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSource {
    Host,
    Service,
}

/// Active checks are launched by the engine, passive ones are submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Active,
    Passive,
}

impl CheckType {
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        if code == 1 { Self::Passive } else { Self::Active }
    }

    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Active => 0,
            Self::Passive => 1,
        }
    }
}

/// Check option bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckOptions(u32);

impl CheckOptions {
    pub const NONE: Self = Self(0);
    pub const FORCE_EXECUTION: Self = Self(1);
    pub const FRESHNESS_CHECK: Self = Self(2);
    pub const ORPHAN_CHECK: Self = Self(4);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_forced(self) -> bool {
        self.contains(Self::FORCE_EXECUTION)
    }
}

impl BitOr for CheckOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for CheckOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("none");
        }
        let mut names = Vec::new();
        if self.contains(Self::FORCE_EXECUTION) {
            names.push("force");
        }
        if self.contains(Self::FRESHNESS_CHECK) {
            names.push("freshness");
        }
        if self.contains(Self::ORPHAN_CHECK) {
            names.push("orphan");
        }
        f.write_str(&names.join("|"))
    }
}

/// Everything needed to update a checkable's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub object_check_type: CheckSource,
    pub host_id: HostId,
    pub service_id: Option<ServiceId>,
    pub check_type: CheckType,
    pub check_options: CheckOptions,
    pub reschedule_check: bool,
    pub latency: f64,
    pub start_time: Timeval,
    pub finish_time: Timeval,
    pub early_timeout: bool,
    pub exited_ok: bool,
    pub return_code: i32,
    pub output: String,
}

impl Default for CheckResult {
    fn default() -> Self {
        Self {
            object_check_type: CheckSource::Host,
            host_id: HostId::NONE,
            service_id: None,
            check_type: CheckType::Active,
            check_options: CheckOptions::NONE,
            reschedule_check: false,
            latency: 0.0,
            start_time: Timeval::ZERO,
            finish_time: Timeval::ZERO,
            early_timeout: false,
            exited_ok: true,
            return_code: STATE_OK,
            output: String::new(),
        }
    }
}

impl CheckResult {
    /// Complete enough to apply: a resolved host and some output.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.host_id.is_none() && !self.output.is_empty()
    }

    /// Target object, if the identity is resolved.
    #[must_use]
    pub fn object(&self) -> Option<ObjectRef> {
        match self.object_check_type {
            CheckSource::Host if !self.host_id.is_none() => Some(ObjectRef::Host(self.host_id)),
            CheckSource::Service => self.service_id.map(ObjectRef::Service),
            CheckSource::Host => None,
        }
    }

    /// Wall time spent executing, never negative.
    #[must_use]
    pub fn execution_time(&self) -> f64 {
        self.finish_time.seconds_since(self.start_time).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reset_state() {
        let cr = CheckResult::default();
        assert_eq!(cr.object_check_type, CheckSource::Host);
        assert_eq!(cr.check_type, CheckType::Active);
        assert!(!cr.reschedule_check);
        assert!(cr.exited_ok);
        assert!(cr.start_time.is_zero());
        assert!(!cr.is_complete());
    }

    #[test]
    fn completeness_needs_host_and_output() {
        let mut cr = CheckResult {
            host_id: HostId(42),
            ..CheckResult::default()
        };
        assert!(!cr.is_complete());
        cr.output = "OK".to_string();
        assert!(cr.is_complete());
        cr.host_id = HostId::NONE;
        assert!(!cr.is_complete());
    }

    #[test]
    fn service_result_targets_service() {
        let cr = CheckResult {
            object_check_type: CheckSource::Service,
            host_id: HostId(1),
            service_id: Some(ServiceId(7)),
            ..CheckResult::default()
        };
        assert_eq!(cr.object(), Some(ObjectRef::Service(ServiceId(7))));

        let unresolved = CheckResult {
            object_check_type: CheckSource::Service,
            host_id: HostId(1),
            ..CheckResult::default()
        };
        assert_eq!(unresolved.object(), None);
    }

    #[test]
    fn options_compose() {
        let opts = CheckOptions::FORCE_EXECUTION | CheckOptions::FRESHNESS_CHECK;
        assert!(opts.is_forced());
        assert!(opts.contains(CheckOptions::FRESHNESS_CHECK));
        assert!(!opts.contains(CheckOptions::ORPHAN_CHECK));
        assert_eq!(opts.to_string(), "force|freshness");
        assert_eq!(CheckOptions::NONE.to_string(), "none");
    }

    #[test]
    fn execution_time_clamps_negative() {
        let cr = CheckResult {
            start_time: Timeval::from_secs(20),
            finish_time: Timeval::from_secs(10),
            ..CheckResult::default()
        };
        assert!(cr.execution_time().abs() < f64::EPSILON);
    }
}
