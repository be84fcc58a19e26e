// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Control Surface (C7): a newline-delimited JSON request/response
//! protocol over a plain TCP listener, one thread per connection. Each
//! connection speaks the same typed `ControlRequest`/`ControlResponse` pair
//! an in-process caller would use; the wire framing mirrors the one a
//! worker process uses to talk back to the control plane (`worker::ipc`).

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dispatchqos::Dispatcher;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::MIN_MAX_WAIT;
use crate::supervisor::{Caller, Supervisor};
use crate::sync::NoPoison;
use crate::wire::Value;

#[derive(Deserialize)]
#[serde(tag = "op")]
enum ControlRequest {
    StartProcess {
        name: String,
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
    TerminateProcesses {
        names: Vec<String>,
    },
    ManageProcess {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
        max_wait_time: f64,
    },
    ChangeSettings {
        name: String,
        settings: BTreeMap<String, String>,
        #[serde(default = "default_max_wait")]
        max_wait_time: f64,
    },
    GetProcesses,
}

fn default_max_wait() -> f64 {
    5.0
}

#[derive(Serialize, Default)]
struct Ack {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
}

impl Ack {
    fn ok(value: Option<serde_json::Value>) -> Self {
        Ack { ok: true, error: None, value }
    }

    fn err(message: impl Into<String>) -> Self {
        Ack {
            ok: false,
            error: Some(message.into()),
            value: None,
        }
    }
}

#[derive(Serialize)]
struct ProcessInfo {
    #[serde(rename = "type")]
    kind: String,
    commands: Vec<String>,
    settings: BTreeMap<String, Value>,
}

#[derive(Serialize)]
struct ProcessesReply {
    running: BTreeMap<String, ProcessInfo>,
    available_types: BTreeMap<String, Vec<&'static str>>,
    streams: BTreeMap<String, String>,
}

/// Shared state every connection handler dispatches against: the Supervisor
/// owns process lifetime, the Dispatcher owns per-command bounded waiting.
/// Both are reached through the same lock-protected Supervisor so Registry
/// lookups and worker kills never race each other.
pub struct ControlSurface {
    supervisor: Arc<Mutex<Supervisor>>,
    dispatcher: Arc<Dispatcher>,
}

impl ControlSurface {
    pub fn new(supervisor: Supervisor) -> Self {
        let supervisor = Arc::new(Mutex::new(supervisor));
        let failure_handle = Arc::clone(&supervisor);
        let dispatcher = Arc::new(Dispatcher::new(move |name: &str| {
            failure_handle.do_lock().handle_worker_failure(name);
        }));
        ControlSurface { supervisor, dispatcher }
    }

    pub fn supervisor(&self) -> &Arc<Mutex<Supervisor>> {
        &self.supervisor
    }

    /// Binds `host:port` and serves connections until the process exits.
    /// Each accepted connection gets its own thread; a slow or wedged caller
    /// only ever blocks its own connection.
    pub fn serve(self: Arc<Self>, host: &str, port: u16) -> anyhow::Result<()> {
        let listener = TcpListener::bind((host, port))?;
        info!("control surface listening on {host}:{port}");
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("failed to accept control connection: {err}");
                    continue;
                }
            };
            let surface = Arc::clone(&self);
            std::thread::spawn(move || surface.handle_connection(stream));
        }
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream) {
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".to_string());
        let mut writer = match stream.try_clone() {
            Ok(w) => w,
            Err(err) => {
                warn!("could not clone control connection from {peer}: {err}");
                return;
            }
        };
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!("control connection from {peer} read error: {err}");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let ack = match serde_json::from_str::<ControlRequest>(&line) {
                Ok(request) => self.handle_request(request),
                Err(err) => serde_json::to_value(Ack::err(format!("malformed request: {err}"))).unwrap(),
            };
            let Ok(rendered) = serde_json::to_string(&ack) else {
                error!("failed to serialize control response for {peer}");
                return;
            };
            if writeln!(writer, "{rendered}").is_err() || writer.flush().is_err() {
                return;
            }
        }
    }

    fn handle_request(&self, request: ControlRequest) -> serde_json::Value {
        match request {
            ControlRequest::StartProcess { name, kind, args } => {
                let init_args: Vec<Value> = args.into_iter().map(Value::from).collect();
                let mut supervisor = self.lock_supervisor();
                match supervisor.start_process(Caller::External, &name, &kind, init_args) {
                    Ok(stream_id) => serde_json::to_value(Ack::ok(stream_id.map(serde_json::Value::String))).unwrap(),
                    Err(err) => serde_json::to_value(Ack::err(err.to_string())).unwrap(),
                }
            }
            ControlRequest::TerminateProcesses { names } => {
                let mut supervisor = self.lock_supervisor();
                for name in &names {
                    if let Err(err) = supervisor.terminate_process(Caller::External, name) {
                        return serde_json::to_value(Ack::err(err.to_string())).unwrap();
                    }
                }
                serde_json::to_value(Ack::ok(None)).unwrap()
            }
            ControlRequest::ManageProcess { name, command, args, max_wait_time } => {
                self.manage_process(&name, &command, args, max_wait_time)
            }
            ControlRequest::ChangeSettings { name, settings, max_wait_time } => {
                // Each value is a UTF-8 scalar per the control-plane wire
                // contract (bool/int/float/opaque-string), coerced here so
                // the worker receives already-typed JSON.
                let coerced: BTreeMap<String, Value> = settings
                    .into_iter()
                    .map(|(k, v)| (k, Value::coerce_from_wire(&serde_json::Value::String(v))))
                    .collect();
                let args = vec![serde_json::to_value(coerced).unwrap()];
                self.manage_process(&name, "settings", args, max_wait_time)
            }
            ControlRequest::GetProcesses => self.get_processes(),
        }
    }

    fn manage_process(&self, name: &str, command: &str, args: Vec<serde_json::Value>, max_wait_time: f64) -> serde_json::Value {
        if max_wait_time <= 0.0 || Duration::from_secs_f64(max_wait_time) < MIN_MAX_WAIT {
            return serde_json::to_value(Ack::err(format!(
                "max_wait_time below the configured minimum of {:?}",
                MIN_MAX_WAIT
            )))
            .unwrap();
        }

        let link = {
            let mut supervisor = self.lock_supervisor();
            supervisor.reap_dead_workers();
            match supervisor.registry().get(name) {
                Ok(record) => record.link.clone(),
                Err(err) => return serde_json::to_value(Ack::err(err.to_string())).unwrap(),
            }
        };

        let outcome = self.dispatcher.dispatch(
            name,
            &link,
            command.to_string(),
            serde_json::Value::Array(args),
            Duration::from_secs_f64(max_wait_time),
        );
        match outcome.into_result() {
            Ok(value) => serde_json::to_value(Ack::ok(Some(value))).unwrap(),
            Err(message) => serde_json::to_value(Ack::err(message)).unwrap(),
        }
    }

    fn get_processes(&self) -> serde_json::Value {
        let mut supervisor = self.lock_supervisor();
        supervisor.reap_dead_workers();

        let available_types = supervisor
            .available_types()
            .into_iter()
            .map(|(name, descriptor, _)| (name.to_string(), descriptor.init_args.to_vec()))
            .collect();

        let mut running = BTreeMap::new();
        let mut streams = BTreeMap::new();
        let links: Vec<(String, String, dispatchqos::WorkerLink)> = supervisor
            .registry()
            .list()
            .map(|record| (record.name.clone(), record.kind.clone(), record.link.clone()))
            .collect();
        for record in supervisor.registry().list() {
            if let Some(id) = &record.stream_id {
                streams.insert(record.name.clone(), id.clone());
            }
        }
        drop(supervisor);

        for (name, kind, link) in links {
            let outcome = self.dispatcher.dispatch(
                &name,
                &link,
                "describe".to_string(),
                serde_json::Value::Null,
                Duration::from_secs(2),
            );
            match outcome.into_result() {
                Ok(value) => {
                    let described: DescribeReply = match serde_json::from_value(value) {
                        Ok(d) => d,
                        Err(err) => {
                            warn!("worker '{name}' returned a malformed describe reply: {err}");
                            continue;
                        }
                    };
                    running.insert(
                        name,
                        ProcessInfo {
                            kind,
                            commands: described.commands,
                            settings: described.settings,
                        },
                    );
                }
                Err(err) => {
                    warn!("describe failed for worker '{name}': {err}");
                }
            }
        }

        serde_json::to_value(ProcessesReply {
            running,
            available_types,
            streams,
        })
        .unwrap()
    }

    fn lock_supervisor(&self) -> std::sync::MutexGuard<'_, Supervisor> {
        self.supervisor.do_lock()
    }
}

#[derive(Deserialize)]
struct DescribeReply {
    commands: Vec<String>,
    settings: BTreeMap<String, Value>,
}
