//! In-memory host object.

#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;

use crate::checks::check_result::{CheckOptions, CheckResult, CheckSource, CheckType};
use crate::checks::command::Macros;
use crate::core::clock::Timestamp;
use crate::core::config::HostDefinition;
use crate::core::errors::{Result, VigilError};
use crate::objects::output::parse_check_output;
use crate::objects::registry::RescheduleRequests;
use crate::objects::{
    CheckStatus, Checkable, HostCheckable, HostId, HostState, ObjectRef, STATE_OK, STATE_WARNING,
    Viability,
};

pub struct Host {
    id: HostId,
    name: String,
    address: String,
    check_command: Option<String>,
    interval_length: u64,
    aggressive: bool,
    status: Mutex<CheckStatus>,
    reschedules: Arc<RescheduleRequests>,
}

impl Host {
    #[must_use]
    pub fn new(
        id: HostId,
        def: &HostDefinition,
        interval_length: u64,
        aggressive: bool,
        reschedules: Arc<RescheduleRequests>,
    ) -> Self {
        Self {
            id,
            name: def.name.clone(),
            address: if def.address.is_empty() {
                def.name.clone()
            } else {
                def.address.clone()
            },
            check_command: def.check_command.clone(),
            interval_length,
            aggressive,
            status: Mutex::new(CheckStatus::new(
                def.check_interval,
                def.retry_interval,
                def.max_check_attempts,
                def.checks_enabled,
            )),
            reschedules,
        }
    }

    #[must_use]
    pub const fn id(&self) -> HostId {
        self.id
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn state(&self) -> HostState {
        HostState::from_code(self.status.lock().current_state)
    }

    fn map_return_code(&self, code: i32) -> HostState {
        let code = if !self.aggressive && code == STATE_WARNING {
            STATE_OK
        } else {
            code
        };
        if code == STATE_OK {
            HostState::Up
        } else {
            HostState::Down
        }
    }
}

impl Checkable for Host {
    fn object(&self) -> ObjectRef {
        ObjectRef::Host(self.id)
    }

    fn host_id(&self) -> HostId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn check_command(&self) -> Option<&str> {
        self.check_command.as_deref()
    }

    fn status(&self) -> &Mutex<CheckStatus> {
        &self.status
    }

    fn macros(&self) -> Macros {
        let st = self.status.lock();
        let state = HostState::from_code(st.current_state);
        let mut macros = Macros::new();
        macros.insert("HOSTNAME", self.name.as_str());
        macros.insert("HOSTADDRESS", self.address.as_str());
        macros.insert("HOSTSTATE", state.label());
        macros.insert("HOSTSTATEID", state.code().to_string());
        macros.insert("HOSTOUTPUT", st.plugin_output.as_str());
        macros.insert("HOSTATTEMPT", st.current_attempt.to_string());
        macros.insert("LASTHOSTCHECK", st.last_check.to_string());
        macros
    }

    fn verify_check_viability(&self, options: CheckOptions, now: Timestamp) -> Viability {
        if options.is_forced() {
            return Viability::VIABLE;
        }
        let st = self.status.lock();
        if st.checks_enabled {
            Viability::VIABLE
        } else {
            let wait = st.check_interval.max(1).saturating_mul(self.interval_length);
            Viability::retry_at(now.saturating_add(i64::try_from(wait).unwrap_or(i64::MAX)))
        }
    }

    fn handle_async_check_result(&self, result: &CheckResult) -> Result<()> {
        if result.object_check_type != CheckSource::Host || result.host_id != self.id {
            return Err(VigilError::Domain {
                object: self.name.clone(),
                details: format!(
                    "result for {:?} host#{} delivered to host#{}",
                    result.object_check_type, result.host_id.0, self.id.0
                ),
            });
        }

        let mut st = self.status.lock();
        if result.check_type == CheckType::Active {
            st.is_executing = false;
        }
        st.check_type = result.check_type;
        st.latency = result.latency;
        st.execution_time = result.execution_time();
        st.has_been_checked = true;
        st.last_check = if result.start_time.is_zero() {
            result.finish_time.sec
        } else {
            result.start_time.sec
        };
        st.check_options = CheckOptions::NONE;

        let (text, code) = if result.early_timeout {
            (
                format!(
                    "(Host check timed out after {:.2} seconds)",
                    result.execution_time()
                ),
                crate::objects::STATE_CRITICAL,
            )
        } else if !result.exited_ok {
            (
                "(Host check did not exit properly)".to_string(),
                crate::objects::STATE_CRITICAL,
            )
        } else if result.output.is_empty() {
            (
                "(No output returned from host check)".to_string(),
                result.return_code,
            )
        } else {
            (result.output.replace(';', ":"), result.return_code)
        };
        let parsed = parse_check_output(&text);
        st.plugin_output = parsed.short_output;
        st.long_plugin_output = parsed.long_output;
        st.perf_data = parsed.perf_data;

        let state = self.map_return_code(code);
        let last = st.last_check;
        st.record_state(state.code(), result.finish_time.sec.max(last));

        if result.reschedule_check {
            let wait = st.effective_interval().saturating_mul(self.interval_length);
            let next = st
                .last_check
                .saturating_add(i64::try_from(wait).unwrap_or(i64::MAX));
            st.next_check = next;
            self.reschedules.push(ObjectRef::Host(self.id), next);
        }
        drop(st);
        self.update_status();
        Ok(())
    }
}

impl HostCheckable for Host {
    fn process_check_result_3x(
        &self,
        new_state: HostState,
        old_plugin_output: &str,
        _options: CheckOptions,
        now: Timestamp,
    ) -> Result<HostState> {
        let mut st = self.status.lock();
        st.has_been_checked = true;
        if st.last_check == 0 {
            st.last_check = now;
        }
        let changed = st.record_state(new_state.code(), now);
        st.check_options = CheckOptions::NONE;
        let publish = changed || st.plugin_output != old_plugin_output;
        drop(st);
        if publish {
            self.update_status();
        }
        Ok(new_state)
    }
}
