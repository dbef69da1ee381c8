//! Broker notifications: external observers of checks and timed events.
//!
//! Every method has a no-op default, so a sink implements only what it
//! watches. Only check notifications can steer dispatch.

#![allow(missing_docs)]

use crate::checks::check_result::{CheckOptions, CheckType};
use crate::core::clock::{Timestamp, Timeval};
use crate::events::timed_event::{EventKind, Priority};
use crate::objects::ObjectRef;

/// Where in the check lifecycle a notification is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckStage {
    AsyncPrecheck,
    SyncPrecheck,
    Initiate,
    RawStart,
    RawEnd,
    Processed,
}

#[derive(Debug, Clone)]
pub struct CheckNotice<'a> {
    pub stage: CheckStage,
    pub object: ObjectRef,
    pub name: &'a str,
    pub check_type: CheckType,
    pub options: CheckOptions,
    pub command_line: Option<&'a str>,
    pub timeout: u64,
    pub latency: f64,
    pub start_time: Timeval,
    pub end_time: Timeval,
    pub return_code: i32,
    pub output: Option<&'a str>,
}

impl<'a> CheckNotice<'a> {
    #[must_use]
    pub fn new(stage: CheckStage, object: ObjectRef, name: &'a str) -> Self {
        Self {
            stage,
            object,
            name,
            check_type: CheckType::Active,
            options: CheckOptions::NONE,
            command_line: None,
            timeout: 0,
            latency: 0.0,
            start_time: Timeval::ZERO,
            end_time: Timeval::ZERO,
            return_code: 0,
            output: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommandStage {
    Start,
    End,
}

/// The literal OS-level command, as opposed to the logical check.
#[derive(Debug, Clone)]
pub struct SystemCommandNotice<'a> {
    pub stage: SystemCommandStage,
    pub command_line: &'a str,
    pub timeout: u64,
    pub start_time: Timeval,
    pub end_time: Timeval,
    pub early_timeout: bool,
    pub return_code: i32,
    pub output: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedEventStage {
    Add,
    Remove,
    Execute,
    Sleep,
}

/// What the broker wants done with the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerVerdict {
    #[default]
    Continue,
    /// Do not run; the caller should reschedule.
    Cancel,
    /// Do not run; someone else supplied the result.
    Override,
}

pub trait BrokerSink: Send + Sync {
    fn check(&self, _notice: &CheckNotice<'_>) -> BrokerVerdict {
        BrokerVerdict::Continue
    }

    fn system_command(&self, _notice: &SystemCommandNotice<'_>) {}

    fn timed_event(
        &self,
        _stage: TimedEventStage,
        _kind: &EventKind,
        _priority: Priority,
        _run_time: Timestamp,
    ) {
    }
}

/// Broker that observes nothing and never vetoes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBroker;

impl BrokerSink for NullBroker {}
