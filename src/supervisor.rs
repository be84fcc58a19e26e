// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Supervisor (C6): owns the Registry and the stream-port pool, and is
//! the only component allowed to start or kill a worker process. Implements
//! the Start/Terminate protocols of §4.6, including the protected-restart
//! invariant for restricted worker types that are part of the static
//! configuration's baseline.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command as ProcessCommand, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use uuid::Uuid;

use crate::config::{ProcessConfig, WorkerClassConfig, WorkerConfigFile};
use crate::error::OrchestratorError;
use crate::frame_bus::BusEndpoint;
use crate::registry::{Registry, WorkerRecord};
use crate::stream_ports::PortPool;
use crate::wire::Value;
use crate::worker::{self, types};

/// Distinguishes a request that originated inside the control-plane process
/// itself (static startup, protected-restart) from one that arrived over the
/// control surface from an external caller. Restricted worker types may only
/// ever be managed by the former (OQ-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Internal,
    External,
}

/// How long the Supervisor waits after SIGTERM before escalating to SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

struct CatalogEntry {
    descriptor: &'static worker::WorkerDescriptor,
    accessible: bool,
}

/// Everything the Supervisor needs to reconstruct a worker's command line:
/// the binary it re-execs itself as, and the bus/params configuration every
/// worker process shares regardless of type.
pub struct SupervisorConfig {
    pub exe_path: PathBuf,
    pub params_dir: PathBuf,
    pub bus: BusEndpoint,
}

pub struct Supervisor {
    registry: Registry,
    ports: PortPool,
    catalog: BTreeMap<String, CatalogEntry>,
    baseline: BTreeMap<String, ProcessConfig>,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Cross-references the worker-configuration file's `worker_classes`
    /// entries against the compiled-in type catalog: a type named in the
    /// file with no matching factory is a configuration error caught at
    /// startup rather than at first use.
    pub fn new(
        worker_config: &WorkerConfigFile,
        stream_port_range: (u16, u16),
        config: SupervisorConfig,
    ) -> Result<Self> {
        let mut catalog = BTreeMap::new();
        for (name, class) in &worker_config.worker_classes {
            let factory = types::lookup(name)
                .with_context(|| format!("worker class '{name}' has no matching built-in implementation"))?;
            catalog.insert(
                name.clone(),
                CatalogEntry {
                    descriptor: factory.descriptor(),
                    accessible: class.accessible,
                },
            );
        }

        let baseline = worker_config
            .processes
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        Ok(Supervisor {
            registry: Registry::new(),
            ports: PortPool::new(stream_port_range),
            catalog,
            baseline,
            config,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The worker types available for `StartProcess`, with their init-arg
    /// shape and whether an external caller may use them.
    pub fn available_types(&self) -> Vec<(&str, &'static worker::WorkerDescriptor, bool)> {
        self.catalog
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.descriptor, entry.accessible))
            .collect()
    }

    /// Starts every worker named in the static configuration's `processes`
    /// list, in file order, as internal (trusted) starts.
    pub fn start_baseline(&mut self) -> Result<()> {
        let names: Vec<String> = self.baseline.keys().cloned().collect();
        for name in names {
            let process = self.baseline[&name].clone();
            self.start_process(
                Caller::Internal,
                &process.name,
                &process.kind,
                crate::config::args_to_values(&process.args),
            )
            .with_context(|| format!("starting configured worker '{}'", process.name))?;
        }
        Ok(())
    }

    /// Implements the Start protocol: uniqueness, type existence, the
    /// restricted-type gate, stream-port allocation, subprocess spawn, and
    /// Registry insertion. Returns the synthesized stream id, if any.
    pub fn start_process(
        &mut self,
        caller: Caller,
        name: &str,
        kind: &str,
        init_args: Vec<Value>,
    ) -> crate::error::Result<Option<String>> {
        if self.registry.contains(name) {
            return Err(OrchestratorError::NameCollision(name.to_string()));
        }
        let entry = self
            .catalog
            .get(kind)
            .ok_or_else(|| OrchestratorError::UnknownWorkerType(kind.to_string()))?;
        if caller == Caller::External && !entry.accessible {
            return Err(OrchestratorError::RestrictedType(kind.to_string()));
        }

        let stream_port = if entry.descriptor.publishes_stream {
            Some(self.ports.allocate()?)
        } else {
            None
        };
        let stream_id = stream_port.map(|_| Uuid::new_v4().to_string());

        let spawned = self.spawn_worker(name, kind, stream_port, stream_id.clone(), &init_args);
        let (process, link) = match spawned {
            Ok(pair) => pair,
            Err(err) => {
                if let Some(port) = stream_port {
                    self.ports.release(port);
                }
                return Err(OrchestratorError::Internal(err.to_string()));
            }
        };

        info!("started worker '{name}' (type {kind}, pid {})", process.id());
        self.registry.insert(WorkerRecord {
            name: name.to_string(),
            kind: kind.to_string(),
            process,
            link,
            stream_id: stream_id.clone(),
            stream_port,
        })?;
        Ok(stream_id)
    }

    fn spawn_worker(
        &self,
        name: &str,
        kind: &str,
        stream_port: Option<u16>,
        stream_id: Option<String>,
        init_args: &[Value],
    ) -> Result<(std::process::Child, dispatchqos::WorkerLink)> {
        let mut command = ProcessCommand::new(&self.config.exe_path);
        command
            .arg("--worker-role")
            .arg(kind)
            .arg("--worker-name")
            .arg(name)
            .arg("--params-dir")
            .arg(&self.config.params_dir)
            .arg("--host")
            .arg(&self.config.bus.host)
            .arg("--port")
            .arg(self.config.bus.port.to_string())
            .arg("--channel")
            .arg(&self.config.bus.channel)
            .arg("--init-args")
            .arg(serde_json::to_string(init_args)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(port) = stream_port {
            command.arg("--stream-port").arg(port.to_string());
        }
        if let Some(id) = stream_id {
            command.arg("--stream-id").arg(id);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning worker process for '{name}'"))?;
        let link = worker::ipc::spawn_relay(&mut child)?;
        Ok((child, link))
    }

    /// Implements the Terminate protocol: presence and restriction checks,
    /// SIGTERM with a SIGKILL escalation, Registry/port cleanup, and
    /// protected-restart replay for restricted baseline workers.
    pub fn terminate_process(&mut self, caller: Caller, name: &str) -> crate::error::Result<()> {
        let record = self.registry.get(name)?;
        let kind = record.kind.clone();
        if caller == Caller::External {
            if let Some(entry) = self.catalog.get(&kind) {
                if !entry.accessible {
                    return Err(OrchestratorError::RestrictedType(kind));
                }
            }
        }
        self.kill_and_remove(name)?;

        let restricted = self.catalog.get(&kind).map(|e| !e.accessible).unwrap_or(false);
        if restricted {
            if let Some(process) = self.baseline.get(name).cloned() {
                info!("restarting protected worker '{name}' after termination");
                if let Err(err) =
                    self.start_process(Caller::Internal, &process.name, &process.kind, crate::config::args_to_values(&process.args))
                {
                    warn!("failed to restart protected worker '{name}': {err}");
                }
            }
        }
        Ok(())
    }

    fn kill_and_remove(&mut self, name: &str) -> crate::error::Result<()> {
        let mut record = self.registry.remove(name)?;
        let pid = Pid::from_raw(record.process.id() as i32);
        let _ = signal::kill(pid, Signal::SIGTERM);
        match record.process.wait_timeout(TERMINATE_GRACE) {
            Ok(true) => {}
            _ => {
                let _ = signal::kill(pid, Signal::SIGKILL);
                let _ = record.process.wait();
            }
        }
        if let Some(port) = record.stream_port {
            self.ports.release(port);
        }
        Ok(())
    }

    /// Wired as the Dispatcher's `on_worker_failed` callback: a worker that
    /// failed to reply is presumed dead and torn down the same way an
    /// explicit terminate would, including protected-restart.
    pub fn handle_worker_failure(&mut self, name: &str) {
        if !self.registry.contains(name) {
            return;
        }
        warn!("worker '{name}' failed to respond in time, terminating it");
        if let Err(err) = self.terminate_process(Caller::Internal, name) {
            warn!("failed to clean up unresponsive worker '{name}': {err}");
        }
    }

    /// Opportunistic liveness sweep: detects a worker that exited on its own
    /// (crash) between commands, outside of an explicit terminate call, via
    /// a non-blocking `waitpid`. Called before `GetProcesses` and before
    /// starting a new worker so stale entries never accumulate silently.
    pub fn reap_dead_workers(&mut self) {
        let names: Vec<String> = self.registry.list().map(|record| record.name.clone()).collect();
        let mut dead = Vec::new();
        for name in &names {
            if let Ok(record) = self.registry.get_mut(name) {
                match record.process.try_wait() {
                    Ok(Some(_status)) => dead.push(name.clone()),
                    Ok(None) => {}
                    Err(err) => warn!("failed to poll worker '{name}' liveness: {err}"),
                }
            }
        }
        for name in dead {
            warn!("worker '{name}' is no longer running, reaping it");
            if let Err(err) = self.kill_and_remove(&name) {
                warn!("failed to reap dead worker '{name}': {err}");
                continue;
            }
            let kind = self.baseline.get(&name).map(|p| p.kind.clone());
            let restricted = kind
                .as_ref()
                .and_then(|k| self.catalog.get(k))
                .map(|e| !e.accessible)
                .unwrap_or(false);
            if restricted {
                if let Some(process) = self.baseline.get(&name).cloned() {
                    if let Err(err) = self.start_process(
                        Caller::Internal,
                        &process.name,
                        &process.kind,
                        crate::config::args_to_values(&process.args),
                    ) {
                        warn!("failed to restart protected worker '{name}' after crash: {err}");
                    }
                }
            }
        }
    }
}

/// Extension used only by the Supervisor: a bounded, polling wait so
/// termination never blocks indefinitely on a worker ignoring SIGTERM.
trait WaitTimeout {
    fn wait_timeout(&mut self, timeout: Duration) -> Result<bool>;
}

impl WaitTimeout for std::process::Child {
    fn wait_timeout(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_wait()?.is_some() {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}
