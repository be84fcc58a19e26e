// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process integration tests driving the real Supervisor/Dispatcher/
//! Registry against the compiled `probe`/`sentinel` worker types, spawned as
//! genuine child processes of the compiled binary. A background thread
//! stands in for the frame bus: it accepts the subscribe connection and
//! trickles empty frame envelopes so a worker's command-channel poll never
//! stalls waiting on a real pub/sub broker.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use dispatchqos::Dispatcher;
use workerd::config::{ProcessConfig, WorkerClassConfig, WorkerConfigFile};
use workerd::frame_bus::BusEndpoint;
use workerd::supervisor::{Caller, Supervisor, SupervisorConfig};

/// Hosts a throwaway TCP listener that answers every connection with a
/// steady trickle of empty frame envelopes, never closing on its own.
fn spawn_fake_bus() -> BusEndpoint {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind fake bus listener");
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            std::thread::spawn(move || loop {
                let envelope =
                    r#"{"data":"","time":"00:00:00.000000","size":[0,0,0],"frame_number":0}"#;
                if writeln!(stream, "{envelope}").is_err() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            });
        }
    });
    BusEndpoint {
        host: "127.0.0.1".to_string(),
        port,
        channel: "test-channel".to_string(),
    }
}

fn worker_config() -> WorkerConfigFile {
    let mut worker_classes = BTreeMap::new();
    worker_classes.insert(
        "probe".to_string(),
        WorkerClassConfig {
            location: "probe".to_string(),
            accessible: true,
        },
    );
    worker_classes.insert(
        "sentinel".to_string(),
        WorkerClassConfig {
            location: "sentinel".to_string(),
            accessible: false,
        },
    );
    WorkerConfigFile {
        modules_path: "test".to_string(),
        worker_classes,
        processes: vec![ProcessConfig {
            name: "guard".to_string(),
            kind: "sentinel".to_string(),
            args: vec![],
        }],
    }
}

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        exe_path: PathBuf::from(env!("CARGO_BIN_EXE_workerd")),
        params_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("configs/params"),
        bus: spawn_fake_bus(),
    }
}

fn new_supervisor(port_base: u16) -> Supervisor {
    Supervisor::new(&worker_config(), (port_base, port_base + 10), supervisor_config())
        .expect("construct supervisor")
}

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn happy_dispatch_then_unknown_command() {
    let mut supervisor = new_supervisor(19100);
    supervisor
        .start_process(Caller::Internal, "W", "probe", vec![])
        .unwrap();

    let dispatcher = Dispatcher::new(|_| {});
    let link = supervisor.registry().get("W").unwrap().link.clone();

    let reply = dispatcher
        .dispatch("W", &link, "print".to_string(), serde_json::json!(["hi"]), WAIT)
        .into_result()
        .unwrap();
    assert_eq!(reply, serde_json::json!("hi"));

    let err = dispatcher
        .dispatch("W", &link, "nope".to_string(), serde_json::json!([]), WAIT)
        .into_result()
        .unwrap_err();
    assert!(err.contains("not known"));

    supervisor.terminate_process(Caller::Internal, "W").unwrap();
}

#[test]
fn starting_a_duplicate_name_is_a_collision() {
    let mut supervisor = new_supervisor(19200);
    supervisor
        .start_process(Caller::Internal, "W", "probe", vec![])
        .unwrap();

    let err = supervisor
        .start_process(Caller::Internal, "W", "probe", vec![])
        .unwrap_err();
    assert_eq!(err.to_string(), "a worker named 'W' already exists");

    supervisor.terminate_process(Caller::Internal, "W").unwrap();
}

#[test]
fn unknown_worker_lookup_suggests_close_name() {
    let mut supervisor = new_supervisor(19300);
    supervisor
        .start_process(Caller::Internal, "Saver", "probe", vec![])
        .unwrap();

    let err = supervisor.registry().get("Savr").unwrap_err();
    assert!(err.to_string().contains("Saver"));

    supervisor.terminate_process(Caller::Internal, "Saver").unwrap();
}

#[test]
fn settings_change_is_all_or_nothing_and_observable_through_describe() {
    let mut supervisor = new_supervisor(19400);
    supervisor
        .start_process(Caller::Internal, "W", "probe", vec![])
        .unwrap();
    let dispatcher = Dispatcher::new(|_| {});
    let link = supervisor.registry().get("W").unwrap().link.clone();

    let rejected = dispatcher.dispatch(
        "W",
        &link,
        "settings".to_string(),
        serde_json::json!([{"greeting": "hi", "nope": 1}]),
        WAIT,
    );
    assert!(rejected.into_result().is_err());

    let describe = dispatcher
        .dispatch("W", &link, "describe".to_string(), serde_json::Value::Null, WAIT)
        .into_result()
        .unwrap();
    assert_eq!(describe["settings"]["greeting"], serde_json::json!("hello"));

    dispatcher
        .dispatch(
            "W",
            &link,
            "settings".to_string(),
            serde_json::json!([{"greeting": "hi"}]),
            WAIT,
        )
        .into_result()
        .unwrap();

    let describe = dispatcher
        .dispatch("W", &link, "describe".to_string(), serde_json::Value::Null, WAIT)
        .into_result()
        .unwrap();
    assert_eq!(describe["settings"]["greeting"], serde_json::json!("hi"));

    supervisor.terminate_process(Caller::Internal, "W").unwrap();
}

#[test]
fn terminating_a_protected_worker_restarts_it_from_the_baseline() {
    let mut supervisor = new_supervisor(19500);
    supervisor.start_baseline().unwrap();
    assert!(supervisor.registry().contains("guard"));
    let first_pid = supervisor.registry().get("guard").unwrap().process.id();

    supervisor.terminate_process(Caller::Internal, "guard").unwrap();

    assert!(supervisor.registry().contains("guard"));
    let second_pid = supervisor.registry().get("guard").unwrap().process.id();
    assert_ne!(first_pid, second_pid);

    let dispatcher = Dispatcher::new(|_| {});
    let link = supervisor.registry().get("guard").unwrap().link.clone();
    let reply = dispatcher
        .dispatch("guard", &link, "ping".to_string(), serde_json::Value::Null, WAIT)
        .into_result()
        .unwrap();
    assert_eq!(reply, serde_json::json!(true));

    supervisor.terminate_process(Caller::Internal, "guard").unwrap();
}

#[test]
fn streaming_port_exhaustion_rejects_the_extra_worker() {
    let mut worker_classes = BTreeMap::new();
    worker_classes.insert(
        "streamer".to_string(),
        WorkerClassConfig {
            location: "streamer".to_string(),
            accessible: true,
        },
    );
    let config = WorkerConfigFile {
        modules_path: "test".to_string(),
        worker_classes,
        processes: vec![],
    };
    // Exactly one stream port available: the first streamer takes it, the
    // second must fail before spawning anything.
    let mut supervisor =
        Supervisor::new(&config, (20100, 20101), supervisor_config()).expect("construct supervisor");

    supervisor
        .start_process(Caller::Internal, "Stream1", "streamer", vec![])
        .unwrap();
    let err = supervisor
        .start_process(Caller::Internal, "Stream2", "streamer", vec![])
        .unwrap_err();
    assert_eq!(err.to_string(), "all streaming ports are taken");

    supervisor.terminate_process(Caller::Internal, "Stream1").unwrap();
}

#[test]
fn external_caller_cannot_reach_a_restricted_worker_type() {
    let mut supervisor = new_supervisor(19600);
    let err = supervisor
        .start_process(Caller::External, "x", "sentinel", vec![])
        .unwrap_err();
    assert!(err.to_string().contains("restricted"));
}
