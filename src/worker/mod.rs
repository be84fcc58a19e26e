// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Worker Runtime (C2): the loop every worker process runs, interleaving
//! bounded command polling with frame intake, plus the behavioral interface
//! (`WorkerKind`) that replaces the original's deep class hierarchy.

pub mod ipc;
pub mod types;

use std::collections::BTreeMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dispatchqos::{Command, CommandResponse};
use log::{debug, error, info};

use crate::frame_bus::{Frame, FrameSource};
use crate::settings::ParameterSet;
use crate::wire::Value;

/// What `GetProcesses` reports about one worker type without needing runtime
/// reflection: the replacement for introspecting class methods.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub type_name: &'static str,
    pub init_args: &'static [&'static str],
    pub commands: &'static [&'static str],
    pub accessible: bool,
    pub publishes_stream: bool,
}

/// The behavioral interface every worker type implements, parameterized over
/// by the shared runtime loop below. Flattens the original `Vprocess` ->
/// `Streamer`/`VideoSaver`/`StreamBuffer`/`Test` inheritance chain.
pub trait WorkerKind: Send {
    fn descriptor(&self) -> &'static WorkerDescriptor;

    /// Applies one frame. Cheap no-op implementations (e.g. `probe`) are
    /// fine; this is the tuning knob for the command-poll timeout.
    fn process_frame(&mut self, frame: &Frame);

    /// Validates a tentative merged settings view before it is committed.
    /// Returning `Err` aborts the whole settings change.
    fn check_conflict(&self, _tentative: &BTreeMap<String, Value>) -> Result<(), String> {
        Ok(())
    }

    /// Runs once per settings key whose value actually changed, right after
    /// it is committed to the `ParameterSet`, so a worker that caches a hot
    /// field locally (instead of reading the map on every frame) can sync it
    /// and reset any dependent algorithmic state.
    fn prepare_setting_change(&mut self, _key: &str, _value: &Value) {}

    /// Handles a command other than the universal `settings` command.
    /// `Ok(None)` means the command name is not known to this worker type.
    fn handle_command(&mut self, name: &str, args: Value) -> Option<CommandResponse>;

    /// The UUID-derived stream id this worker instance publishes its derived
    /// output under, if any. `None` for worker types that don't publish
    /// (the default for everything but `streamer`).
    fn stream_id(&self) -> Option<&str> {
        None
    }

    /// Extra exposed state that lives outside the generic `ParameterSet`
    /// (e.g. `recorder`'s `recording` flag, which must be visible through
    /// `GetProcesses` but can only ever change via a dedicated command, not
    /// `settings`; see `ParameterSet::hide_from_settings`). Merged into the
    /// reply to the universal `describe` command.
    fn extra_exposed(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

/// How often the runtime polls the command channel before falling back to
/// the next frame. A worker-type constant, typically 20-1000ms.
pub struct RuntimeConfig {
    pub poll_timeout: Duration,
}

/// Drives one worker's interleaved command/frame loop until the command
/// channel is disconnected (the Supervisor killed the process) or the frame
/// source ends.
pub fn run_worker_loop(
    worker_name: &str,
    mut kind: Box<dyn WorkerKind>,
    mut params: ParameterSet,
    command_rx: Receiver<Command>,
    response_tx: Sender<CommandResponse>,
    mut frame_source: Box<dyn FrameSource>,
    config: RuntimeConfig,
) {
    let mut last_sequence: Option<u64> = None;

    loop {
        match command_rx.recv_timeout(config.poll_timeout) {
            Ok(command) => {
                let response = dispatch_command(worker_name, &mut kind, &mut params, command);
                if response_tx.send(response).is_err() {
                    debug!("worker {worker_name} response channel closed, stopping");
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => match frame_source.next_frame() {
                Ok(Some(frame)) => {
                    if let Some(previous) = last_sequence {
                        let missed = frame.sequence.saturating_sub(previous).saturating_sub(1);
                        if missed > 0 {
                            debug!("worker {worker_name} missed {missed} frame(s)");
                        }
                    }
                    last_sequence = Some(frame.sequence);
                    kind.process_frame(&frame);
                }
                Ok(None) => {
                    info!("worker {worker_name} frame source exhausted, stopping");
                    return;
                }
                Err(err) => {
                    error!("worker {worker_name} lost its frame source: {err}");
                    return;
                }
            },
            Err(RecvTimeoutError::Disconnected) => {
                debug!("worker {worker_name} command channel disconnected, stopping");
                return;
            }
        }
    }
}

fn dispatch_command(
    worker_name: &str,
    kind: &mut Box<dyn WorkerKind>,
    params: &mut ParameterSet,
    command: Command,
) -> CommandResponse {
    if command.name == "settings" {
        return handle_settings_command(kind, params, command.args);
    }
    if command.name == "describe" {
        return Ok(handle_describe_command(kind, params));
    }

    match kind.handle_command(&command.name, Value::from(command.args)) {
        Some(response) => response,
        None => Err(format!(
            "command '{}' is not known to worker '{worker_name}'",
            command.name
        )),
    }
}

fn handle_settings_command(
    kind: &mut Box<dyn WorkerKind>,
    params: &mut ParameterSet,
    args: serde_json::Value,
) -> CommandResponse {
    // `ManageProcess`'s convention wraps every command's positional args in a
    // list; `settings`'s single logical argument is the map itself, i.e.
    // `[settings_map]`. Also accept a bare map for direct in-process callers.
    let requested = match Value::from(args) {
        Value::Map(map) => map,
        Value::List(mut items) if items.len() == 1 => match items.pop() {
            Some(Value::Map(map)) => map,
            _ => return Err("settings command expects a mapping of name to value".to_string()),
        },
        _ => return Err("settings command expects a mapping of name to value".to_string()),
    };

    let mut changed_keys = Vec::new();
    let result = params.apply_settings(
        &requested,
        |tentative| kind.check_conflict(tentative),
        |key| changed_keys.push(key.to_string()),
    );

    match result {
        Ok(()) => {
            for key in &changed_keys {
                if let Some(value) = params.exposed().get(key) {
                    kind.prepare_setting_change(key, value);
                }
            }
            Ok(Value::Bool(true).into())
        }
        Err(err) => Err(err.to_string()),
    }
}

/// The universal `describe` command: every worker type answers it with its
/// static command table and its current live settings, the IPC round trip
/// `GetProcesses` needs since settings state lives inside the worker
/// process, not the control plane.
fn handle_describe_command(kind: &Box<dyn WorkerKind>, params: &ParameterSet) -> serde_json::Value {
    let mut settings = params.exposed().clone();
    settings.extend(kind.extra_exposed());
    let descriptor = kind.descriptor();
    Value::Map(BTreeMap::from([
        (
            "commands".to_string(),
            Value::List(descriptor.commands.iter().map(|c| Value::Str(c.to_string())).collect()),
        ),
        ("settings".to_string(), Value::Map(settings)),
    ]))
    .into()
}
