//! End-to-end scheduling scenarios through the public library surface:
//! dispatch gating, completion merging, the spool directory, cached host
//! checks and repeated rescheduling passes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use vigil::checks::check_result::CheckOptions;
use vigil::checks::checker::{Checker, CheckerSettings, DispatchOutcome};
use vigil::checks::execution::{ExecutionResult, ExecutionStatus};
use vigil::core::clock::{self, Timeval};
use vigil::core::config::{CommandDefinition, Config, HostDefinition, ServiceDefinition};
use vigil::daemon::loop_main::{Engine, EngineParts, Tick};
use vigil::events::adjust::adjust_check_scheduling;
use vigil::events::queue::EventQueue;
use vigil::events::timed_event::{EventKind, Priority, TimedEvent};
use vigil::objects::registry::ObjectStore;
use vigil::objects::{Checkable, HostId, HostState, ObjectRegistry, ServiceId};

use common::{RecordingBackend, web_commands, web_store, write_spool};

struct Harness {
    backend: Arc<RecordingBackend>,
    store: Arc<ObjectStore>,
    checker: Checker,
}

fn harness(settings: CheckerSettings) -> Harness {
    let store = web_store();
    let backend = Arc::new(RecordingBackend::default());
    let checker = Checker::new(
        settings,
        backend.clone(),
        web_commands(),
        store.clone() as Arc<dyn ObjectRegistry>,
    );
    Harness {
        backend,
        store,
        checker,
    }
}

fn spool_harness(dir: &std::path::Path) -> Harness {
    harness(CheckerSettings {
        check_result_path: Some(dir.to_path_buf()),
        max_check_result_file_age: Duration::from_secs(3600),
        ..CheckerSettings::default()
    })
}

// ──────────────────── dispatch and merge ────────────────────

#[test]
fn unforced_check_is_dispatched_once_while_in_flight() {
    let h = harness(CheckerSettings::default());
    let svc = h.store.get_service(ServiceId(1)).expect("service");

    let first = h
        .checker
        .run(svc.as_ref(), CheckOptions::NONE, 0.0, true, true)
        .expect("first run");
    let second = h
        .checker
        .run(svc.as_ref(), CheckOptions::NONE, 0.0, true, true)
        .expect("second run");

    assert!(matches!(first, DispatchOutcome::Dispatched(_)));
    assert_eq!(second, DispatchOutcome::AlreadyRunning);
    assert_eq!(h.backend.submissions(), 1);
}

#[test]
fn completion_is_merged_and_applied_once() {
    let h = harness(CheckerSettings::default());
    let host = h.store.get_host(HostId(1)).expect("host");

    let DispatchOutcome::Dispatched(id) = h
        .checker
        .run(host.as_ref(), CheckOptions::NONE, 0.25, true, true)
        .expect("run")
    else {
        panic!("host check was not dispatched");
    };
    assert_eq!(h.backend.submitted.lock()[0], "ping -w 100 10.0.0.1");

    h.checker.finished(ExecutionResult {
        command_id: id,
        start_time: Timeval::from_secs(5_000),
        end_time: Timeval::from_secs(5_002),
        exit_code: 2,
        status: ExecutionStatus::Normal,
        output: "PING CRITICAL - 100% loss".to_string(),
    });

    let summary = h.checker.reap();
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.orphaned, 0);
    assert_eq!(h.checker.pending_len(), 0);

    let st = host.status().lock();
    assert_eq!(HostState::from_code(st.current_state), HostState::Down);
    assert_eq!(st.plugin_output, "PING CRITICAL - 100% loss");
    assert!(!st.is_executing);
    assert!(st.has_been_checked);
    drop(st);

    // Nothing left to apply on the next pass.
    assert_eq!(h.checker.reap().applied, 0);
}

// ──────────────────── spool directory ────────────────────

#[test]
fn ready_spool_file_is_applied_and_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = spool_harness(dir.path());
    let path = write_spool(
        dir.path(),
        "c123456",
        "host_name=web1\nreturn_code=0\nexited_ok=1\nfinish_time=1000.0\noutput=OK - ping 1ms\n\n",
        true,
    );

    let summary = h.checker.reap();
    assert_eq!(summary.files, 1);
    assert_eq!(summary.applied, 1);

    let host = h.store.get_host(HostId(1)).expect("host");
    let st = host.status().lock();
    assert_eq!(st.current_state, 0);
    assert_eq!(st.plugin_output, "OK - ping 1ms");
    drop(st);

    assert!(!path.exists());
    assert!(!dir.path().join("c123456.ok").exists());
}

#[test]
fn spool_file_without_sentinel_is_left_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = spool_harness(dir.path());
    let path = write_spool(
        dir.path(),
        "c123456",
        "host_name=web1\nreturn_code=0\nexited_ok=1\nfinish_time=1000.0\noutput=OK - ping 1ms\n\n",
        false,
    );

    let summary = h.checker.reap();
    assert_eq!(summary.files, 0);
    assert_eq!(summary.applied, 0);
    assert!(path.exists());
    assert!(!h.store.get_host(HostId(1)).expect("host").status().lock().has_been_checked);
}

#[test]
fn record_without_output_never_reaches_the_host() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = spool_harness(dir.path());
    write_spool(dir.path(), "cnoout1", "host_name=web1\nstart_time=1000.5\n\n", true);

    let summary = h.checker.reap();
    assert_eq!(summary.applied, 0);
    assert_eq!(summary.missing_target, 0);
    assert!(!h.store.get_host(HostId(1)).expect("host").status().lock().has_been_checked);
}

#[test]
fn stale_spool_file_is_deleted_without_delivery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = spool_harness(dir.path());
    let path = write_spool(
        dir.path(),
        "cstale1",
        "host_name=web1\nreturn_code=0\noutput=OK\n\nfile_time=1000\nhost_name=web1\noutput=late\n",
        true,
    );

    let summary = h.checker.reap();
    assert_eq!(summary.applied, 0);
    assert!(!path.exists());
    assert!(!dir.path().join("cstale1.ok").exists());
    assert!(!h.store.get_host(HostId(1)).expect("host").status().lock().has_been_checked);
}

// ──────────────────── on-demand host checks ────────────────────

#[test]
fn cached_host_state_respects_the_horizon() {
    let h = harness(CheckerSettings::default());
    let host = h.store.get_host(HostId(1)).expect("host");
    {
        let mut st = host.status().lock();
        st.has_been_checked = true;
        st.last_check = clock::now() - 5;
    }

    let state = h
        .checker
        .run_sync(host.as_ref(), CheckOptions::NONE, true, 60)
        .expect("cached run");
    assert_eq!(state, HostState::Up);
    assert_eq!(h.backend.submissions(), 0);

    h.checker
        .run_sync(host.as_ref(), CheckOptions::NONE, true, 2)
        .expect("real run");
    assert_eq!(h.backend.submissions(), 1);
    assert_eq!(host.status().lock().plugin_output, "PING OK - rta 0.2ms");
}

// ──────────────────── rescheduling ────────────────────

#[test]
fn repeated_adjustment_does_not_drift() {
    let store = Arc::new(ObjectStore::new(60, false));
    store
        .add_host(&HostDefinition {
            name: "web1".to_string(),
            ..HostDefinition::default()
        })
        .expect("host");
    for n in 0..5 {
        store
            .add_service(&ServiceDefinition {
                host_name: "web1".to_string(),
                description: format!("svc{n}"),
                ..ServiceDefinition::default()
            })
            .expect("service");
    }

    let mut queue = EventQueue::new();
    for id in 1..=5 {
        queue.schedule(
            TimedEvent::once(
                EventKind::ServiceCheck {
                    service: ServiceId(id),
                },
                2_030,
            ),
            Priority::Low,
        );
    }

    let first = adjust_check_scheduling(&mut queue, store.as_ref(), 300, 2_000);
    assert!(first.bumped);
    let after_first: Vec<_> = queue.iter(Priority::Low).map(|(_, e)| e.run_time).collect();

    for _ in 0..3 {
        let again = adjust_check_scheduling(&mut queue, store.as_ref(), 300, 2_000);
        assert!(!again.bumped);
        let now: Vec<_> = queue.iter(Priority::Low).map(|(_, e)| e.run_time).collect();
        assert_eq!(now, after_first);
    }
    assert!(after_first.windows(2).all(|w| w[0] <= w[1]));
}

// ──────────────────── engine ────────────────────

fn engine_config() -> Config {
    let mut cfg = Config::default();
    cfg.objects.commands.push(CommandDefinition {
        name: "check_dummy".to_string(),
        command_line: "true $HOSTNAME$".to_string(),
    });
    cfg.objects.hosts.push(HostDefinition {
        name: "web1".to_string(),
        check_command: Some("check_dummy".to_string()),
        ..HostDefinition::default()
    });
    cfg.objects.services.push(ServiceDefinition {
        host_name: "web1".to_string(),
        description: "HTTP".to_string(),
        check_command: Some("check_dummy".to_string()),
        ..ServiceDefinition::default()
    });
    cfg
}

#[test]
fn engine_dispatches_every_object_once_the_schedule_comes_due() {
    let backend = Arc::new(RecordingBackend::default());
    let mut engine =
        Engine::new(engine_config(), EngineParts::quiet(backend.clone())).expect("engine");
    let t0 = 1_700_000_000;
    engine.start(t0);
    assert_eq!(engine.queue().len(Priority::Low), 2);

    // Walk the clock forward in small steps so no step looks like a jump.
    let mut ran = Vec::new();
    for now in (t0..=t0 + 3_600).step_by(30) {
        while let Tick::Ran(kind) = engine.tick(now) {
            ran.push(kind);
        }
    }

    assert!(ran.contains(&EventKind::CheckReaper));
    assert!(ran.contains(&EventKind::HostCheck { host: HostId(1) }));
    assert!(ran.contains(&EventKind::ServiceCheck {
        service: ServiceId(1)
    }));
    assert_eq!(backend.submissions(), 2);
    assert!(
        engine
            .store()
            .get_host(HostId(1))
            .expect("host")
            .status()
            .lock()
            .is_executing
    );
}
