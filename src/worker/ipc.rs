// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The framed newline-delimited-JSON protocol that carries commands and
//! responses across the pipe between a worker's own stdin/stdout and the
//! control-plane process that spawned it. The same wire shape as the
//! control surface's own transport (`control.rs`), so a worker process is,
//! from the control plane's point of view, just another JSON line speaker.
//!
//! This module provides both ends: [`spawn_relay`] runs in the control-plane
//! process, bridging a `Child`'s stdio to the in-memory [`WorkerLink`]
//! channels the Dispatcher already knows how to talk to; [`stdio_worker_link`]
//! runs inside the worker process itself, bridging its own stdio to the
//! `Receiver<Command>`/`Sender<CommandResponse>` pair `run_worker_loop`
//! expects.

use std::io::{BufRead, BufReader, Write};
use std::process::Child;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use dispatchqos::{Command, CommandResponse, WorkerLink};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct WireCommand {
    name: String,
    args: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<Command> for WireCommand {
    fn from(command: Command) -> Self {
        WireCommand {
            name: command.name,
            args: command.args,
        }
    }
}

impl From<WireCommand> for Command {
    fn from(wire: WireCommand) -> Self {
        Command {
            name: wire.name,
            args: wire.args,
        }
    }
}

impl From<CommandResponse> for WireResponse {
    fn from(response: CommandResponse) -> Self {
        match response {
            Ok(value) => WireResponse {
                ok: true,
                value: Some(value),
                error: None,
            },
            Err(message) => WireResponse {
                ok: false,
                value: None,
                error: Some(message),
            },
        }
    }
}

impl From<WireResponse> for CommandResponse {
    fn from(wire: WireResponse) -> Self {
        if wire.ok {
            Ok(wire.value.unwrap_or(serde_json::Value::Null))
        } else {
            Err(wire.error.unwrap_or_else(|| "worker reported an error".to_string()))
        }
    }
}

/// Spawned inside the control-plane process right after a child is forked.
/// Owns two relay threads for the lifetime of the child: one serializes
/// outgoing [`Command`]s onto the child's stdin, the other deserializes
/// incoming [`CommandResponse`]s from the child's stdout. Returns the
/// [`WorkerLink`] handle the Dispatcher uses exactly as if the worker were
/// an in-process thread.
pub fn spawn_relay(child: &mut Child) -> anyhow::Result<WorkerLink> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("child worker was not spawned with a piped stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("child worker was not spawned with a piped stdout"))?;

    let (command_tx, command_rx) = bounded::<Command>(1);
    let (response_tx, response_rx) = bounded::<CommandResponse>(1);

    spawn_stdin_writer(stdin, command_rx);
    spawn_stdout_reader(stdout, response_tx);

    Ok(WorkerLink {
        command_tx,
        response_rx,
    })
}

fn spawn_stdin_writer(mut stdin: std::process::ChildStdin, command_rx: Receiver<Command>) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(command) = command_rx.recv() {
            let wire = WireCommand::from(command);
            let line = match serde_json::to_string(&wire) {
                Ok(line) => line,
                Err(err) => {
                    warn!("failed to serialize outgoing command: {err}");
                    continue;
                }
            };
            if writeln!(stdin, "{line}").is_err() || stdin.flush().is_err() {
                debug!("worker stdin closed, stopping relay");
                return;
            }
        }
    })
}

fn spawn_stdout_reader(stdout: std::process::ChildStdout, response_tx: Sender<CommandResponse>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(Ok(line)) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<WireResponse>(&line) {
                Ok(wire) => CommandResponse::from(wire),
                Err(err) => Err(format!("malformed response from worker: {err}")),
            };
            if response_tx.send(response).is_err() {
                return;
            }
        }
    })
}

/// Runs inside a worker process. Spawns the mirror-image relay threads over
/// its own stdin/stdout and returns the channel pair `run_worker_loop` reads
/// commands from and writes responses to.
pub fn stdio_worker_link() -> (Receiver<Command>, Sender<CommandResponse>) {
    let (command_tx, command_rx) = bounded::<Command>(1);
    let (response_tx, response_rx) = bounded::<CommandResponse>(1);

    thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut lines = stdin.lock().lines();
        while let Some(Ok(line)) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WireCommand>(&line) {
                Ok(wire) => {
                    if command_tx.send(Command::from(wire)).is_err() {
                        return;
                    }
                }
                Err(err) => warn!("malformed command from control plane: {err}"),
            }
        }
    });

    thread::spawn(move || {
        let mut stdout = std::io::stdout();
        while let Ok(response) = response_rx.recv() {
            let wire = WireResponse::from(response);
            if let Ok(line) = serde_json::to_string(&wire) {
                if writeln!(stdout, "{line}").is_err() || stdout.flush().is_err() {
                    return;
                }
            }
        }
    });

    (command_rx, response_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_wire_shape() {
        let command = Command {
            name: "print".to_string(),
            args: serde_json::json!(["hi"]),
        };
        let wire = WireCommand::from(command);
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "print");
        assert_eq!(back.args, serde_json::json!(["hi"]));
    }

    #[test]
    fn error_response_round_trips() {
        let response: CommandResponse = Err("nope is not known".to_string());
        let wire = WireResponse::from(response);
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireResponse = serde_json::from_str(&json).unwrap();
        let response_back = CommandResponse::from(back);
        assert_eq!(response_back.unwrap_err(), "nope is not known");
    }
}
