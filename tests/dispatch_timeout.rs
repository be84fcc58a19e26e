// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exercises the Dispatcher's timeout-then-terminate path directly against a
//! hand-rolled worker thread, without a real subprocess or frame bus: all the
//! Dispatcher needs is a `WorkerLink`'s channel pair, and a thread that holds
//! a command past its deadline before replying is enough to reproduce the
//! "still stuck after `max_wait`" scenario without a literal 20-second sleep.

use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use dispatchqos::{Command, DispatchFailure, DispatchOutcome, Dispatcher, WorkerLink};

/// A worker thread that answers every command after `delay`, regardless of
/// what was asked.
fn spawn_slow_worker(delay: Duration) -> WorkerLink {
    let (command_tx, command_rx) = bounded::<Command>(1);
    let (response_tx, response_rx) = bounded(1);
    thread::spawn(move || {
        while let Ok(_command) = command_rx.recv() {
            thread::sleep(delay);
            if response_tx.send(Ok(serde_json::json!("late"))).is_err() {
                return;
            }
        }
    });
    WorkerLink {
        command_tx,
        response_rx,
    }
}

#[test]
fn slow_worker_is_reported_as_not_replying_in_time() {
    let link = spawn_slow_worker(Duration::from_millis(500));
    let dispatcher = Dispatcher::new(|_| {});

    let outcome = dispatcher.dispatch(
        "W",
        &link,
        "anything".to_string(),
        serde_json::Value::Null,
        Duration::from_millis(50),
    );

    assert!(matches!(
        outcome,
        DispatchOutcome::Failed(DispatchFailure::NoReplyInTime)
    ));
}

#[test]
fn on_worker_failed_fires_once_per_unresponsive_worker() {
    let link = spawn_slow_worker(Duration::from_secs(2));
    let (failed_tx, failed_rx) = bounded::<String>(4);
    let dispatcher = Dispatcher::new(move |name: &str| {
        let _ = failed_tx.send(name.to_string());
    });

    let outcome = dispatcher.dispatch(
        "W",
        &link,
        "anything".to_string(),
        serde_json::Value::Null,
        Duration::from_millis(50),
    );
    assert!(matches!(
        outcome,
        DispatchOutcome::Failed(DispatchFailure::NoReplyInTime)
    ));

    let failed_name = failed_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(failed_name, "W");
}

#[test]
fn a_worker_that_replies_in_time_never_reports_failure() {
    let (command_tx, command_rx) = bounded::<Command>(1);
    let (response_tx, response_rx) = bounded(1);
    thread::spawn(move || {
        while let Ok(command) = command_rx.recv() {
            let _ = response_tx.send(Ok(command.args));
        }
    });
    let link = WorkerLink {
        command_tx,
        response_rx,
    };
    let dispatcher = Dispatcher::new(|name: &str| panic!("unexpected failure for {name}"));

    let outcome = dispatcher.dispatch(
        "W",
        &link,
        "print".to_string(),
        serde_json::json!("hi"),
        Duration::from_secs(2),
    );
    assert_eq!(outcome.into_result().unwrap(), serde_json::json!("hi"));
}
