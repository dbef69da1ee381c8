//! In-memory service object.

#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;

use crate::checks::check_result::{CheckOptions, CheckResult, CheckSource, CheckType};
use crate::checks::command::Macros;
use crate::core::clock::Timestamp;
use crate::core::config::ServiceDefinition;
use crate::core::errors::{Result, VigilError};
use crate::objects::output::parse_check_output;
use crate::objects::registry::RescheduleRequests;
use crate::objects::{
    CheckStatus, Checkable, HostId, ObjectRef, STATE_CRITICAL, STATE_UNKNOWN, ServiceId,
    ServiceState, Viability,
};

pub struct Service {
    id: ServiceId,
    host_id: HostId,
    host_name: String,
    host_address: String,
    description: String,
    check_command: Option<String>,
    interval_length: u64,
    status: Mutex<CheckStatus>,
    reschedules: Arc<RescheduleRequests>,
}

impl Service {
    #[must_use]
    pub fn new(
        id: ServiceId,
        host_id: HostId,
        host_address: &str,
        def: &ServiceDefinition,
        interval_length: u64,
        reschedules: Arc<RescheduleRequests>,
    ) -> Self {
        Self {
            id,
            host_id,
            host_name: def.host_name.clone(),
            host_address: host_address.to_string(),
            description: def.description.clone(),
            check_command: def.check_command.clone(),
            interval_length,
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
    pub const fn id(&self) -> ServiceId {
        self.id
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        ServiceState::from_return_code(self.status.lock().current_state)
    }
}

impl Checkable for Service {
    fn object(&self) -> ObjectRef {
        ObjectRef::Service(self.id)
    }

    fn host_id(&self) -> HostId {
        self.host_id
    }

    fn name(&self) -> String {
        format!("{}/{}", self.host_name, self.description)
    }

    fn check_command(&self) -> Option<&str> {
        self.check_command.as_deref()
    }

    fn status(&self) -> &Mutex<CheckStatus> {
        &self.status
    }

    fn macros(&self) -> Macros {
        let st = self.status.lock();
        let state = ServiceState::from_return_code(st.current_state);
        let mut macros = Macros::new();
        macros.insert("HOSTNAME", self.host_name.as_str());
        macros.insert("HOSTADDRESS", self.host_address.as_str());
        macros.insert("SERVICEDESC", self.description.as_str());
        macros.insert("SERVICESTATE", state.label());
        macros.insert("SERVICESTATEID", state.code().to_string());
        macros.insert("SERVICEOUTPUT", st.plugin_output.as_str());
        macros.insert("SERVICEATTEMPT", st.current_attempt.to_string());
        macros.insert("LASTSERVICECHECK", st.last_check.to_string());
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
        if result.object_check_type != CheckSource::Service || result.service_id != Some(self.id)
        {
            return Err(VigilError::Domain {
                object: self.name(),
                details: format!(
                    "result for {:?} {:?} delivered to service#{}",
                    result.object_check_type, result.service_id, self.id.0
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
                    "(Service check timed out after {:.2} seconds)",
                    result.execution_time()
                ),
                STATE_CRITICAL,
            )
        } else if !result.exited_ok {
            (
                "(Service check did not exit properly)".to_string(),
                STATE_CRITICAL,
            )
        } else if result.output.is_empty() {
            (
                "(No output returned from plugin)".to_string(),
                STATE_UNKNOWN,
            )
        } else {
            (result.output.clone(), result.return_code)
        };
        let parsed = parse_check_output(&text);
        st.plugin_output = parsed.short_output;
        st.long_plugin_output = parsed.long_output;
        st.perf_data = parsed.perf_data;

        let state = ServiceState::from_return_code(code);
        let last = st.last_check;
        st.record_state(state.code(), result.finish_time.sec.max(last));

        if result.reschedule_check {
            let wait = st.effective_interval().saturating_mul(self.interval_length);
            let next = st
                .last_check
                .saturating_add(i64::try_from(wait).unwrap_or(i64::MAX));
            st.next_check = next;
            self.reschedules.push(ObjectRef::Service(self.id), next);
        }
        drop(st);
        self.update_status();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::Timeval;
    use crate::objects::StateType;

    fn service() -> Service {
        let def = ServiceDefinition {
            host_name: "web1".to_string(),
            description: "HTTP".to_string(),
            check_command: Some("check_http".to_string()),
            retry_interval: 2,
            ..ServiceDefinition::default()
        };
        Service::new(
            ServiceId(3),
            HostId(1),
            "10.0.0.1",
            &def,
            60,
            Arc::new(RescheduleRequests::default()),
        )
    }

    fn result(code: i32) -> CheckResult {
        CheckResult {
            object_check_type: CheckSource::Service,
            host_id: HostId(1),
            service_id: Some(ServiceId(3)),
            start_time: Timeval::from_secs(500),
            finish_time: Timeval::from_secs(501),
            return_code: code,
            output: "HTTP CRITICAL - refused".to_string(),
            reschedule_check: true,
            ..CheckResult::default()
        }
    }

    #[test]
    fn critical_result_retries_at_retry_interval() {
        let svc = service();
        svc.handle_async_check_result(&result(2)).expect("apply");
        let st = svc.status().lock().clone();
        assert_eq!(svc.state(), ServiceState::Critical);
        assert_eq!(st.state_type, StateType::Soft);
        assert_eq!(st.next_check, 500 + 2 * 60);
    }

    #[test]
    fn state_change_uses_finish_time_when_later() {
        let svc = service();
        svc.handle_async_check_result(&result(2)).expect("apply");
        assert_eq!(svc.status().lock().last_state_change, 501);

        let mut skewed = result(0);
        skewed.start_time = Timeval::from_secs(700);
        skewed.finish_time = Timeval::from_secs(650);
        svc.handle_async_check_result(&skewed).expect("apply");
        let st = svc.status().lock();
        assert_eq!(st.last_check, 700);
        assert_eq!(st.last_state_change, 700);
    }

    #[test]
    fn killed_plugin_is_critical() {
        let svc = service();
        let mut cr = result(0);
        cr.exited_ok = false;
        svc.handle_async_check_result(&cr).expect("apply");
        assert_eq!(svc.state(), ServiceState::Critical);
        assert_eq!(
            svc.status().lock().plugin_output,
            "(Service check did not exit properly)"
        );
    }

    #[test]
    fn host_result_is_rejected() {
        let svc = service();
        let mut cr = result(0);
        cr.object_check_type = CheckSource::Host;
        assert!(svc.handle_async_check_result(&cr).is_err());
    }

    #[test]
    fn macros_carry_host_and_description() {
        let macros = service().macros();
        assert_eq!(macros.get("HOSTNAME"), Some("web1"));
        assert_eq!(macros.get("SERVICEDESC"), Some("HTTP"));
        assert_eq!(macros.get("HOSTADDRESS"), Some("10.0.0.1"));
    }
}
