// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Entry point for both halves of this binary: the control-plane process
//! (default) and a worker process (`--worker-role ...`). The Supervisor
//! re-execs this same binary to start a worker rather than linking a second
//! binary target, so the worker-role branch below is effectively a second,
//! much smaller `main`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use workerd::{config, control, frame_bus, settings, supervisor, worker, wire};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--worker-role") {
        run_worker(&args)
    } else {
        run_control_plane(&args)
    }
}

fn run_control_plane(args: &[String]) -> Result<()> {
    let orchestrator_config = config::OrchestratorConfig::from_args(args)?;
    stderrlog::new()
        .module(module_path!())
        .verbosity(orchestrator_config.verbosity + 2)
        .init()
        .context("initializing logging")?;

    let worker_config = config::WorkerConfigFile::load(&orchestrator_config.config_file)?;
    let exe_path = std::env::current_exe().context("resolving own executable path")?;

    let mut supervisor = supervisor::Supervisor::new(
        &worker_config,
        orchestrator_config.stream_port_range,
        supervisor::SupervisorConfig {
            exe_path,
            params_dir: orchestrator_config.params_dir.clone(),
            bus: orchestrator_config.bus.clone(),
        },
    )?;
    supervisor.start_baseline().context("starting configured workers")?;

    let surface = Arc::new(control::ControlSurface::new(supervisor));
    surface.serve(&orchestrator_config.control_host, orchestrator_config.control_port)
}

/// Re-invoked by the Supervisor (`supervisor::Supervisor::spawn_worker`) as a
/// child process. Builds the named worker type from the compiled-in catalog
/// and runs its command/frame loop over stdio until the control plane kills
/// it or the frame bus connection ends.
fn run_worker(args: &[String]) -> Result<()> {
    let mut opts = getopts::Options::new();
    opts.reqopt("", "worker-role", "compiled-in worker type to build", "KIND");
    opts.reqopt("", "worker-name", "name this worker is registered under", "NAME");
    opts.reqopt("", "params-dir", "directory of per-type parameter layer files", "PATH");
    opts.optopt("", "host", "frame bus host", "HOST");
    opts.optopt("", "port", "frame bus port", "PORT");
    opts.optopt("", "channel", "frame bus channel", "CHANNEL");
    opts.optopt("", "stream-port", "allocated stream port, if this type publishes", "PORT");
    opts.optopt("", "stream-id", "assigned stream id, if this type publishes", "ID");
    opts.optopt("", "init-args", "JSON array of positional constructor args", "JSON");
    let matches = opts.parse(args).context("parsing worker process arguments")?;

    let kind_name = matches.opt_str("worker-role").expect("required by reqopt");
    let name = matches.opt_str("worker-name").expect("required by reqopt");
    let params_dir = PathBuf::from(matches.opt_str("params-dir").expect("required by reqopt"));

    let bus = frame_bus::BusEndpoint {
        host: matches.opt_str("host").unwrap_or_else(|| config::DEFAULT_HOST.to_string()),
        port: match matches.opt_str("port") {
            Some(raw) => raw.parse().with_context(|| format!("invalid --port value '{raw}'"))?,
            None => config::DEFAULT_BUS_PORT,
        },
        channel: matches.opt_str("channel").unwrap_or_else(|| config::DEFAULT_CHANNEL.to_string()),
    };
    let stream_port = matches
        .opt_str("stream-port")
        .map(|raw| raw.parse().with_context(|| format!("invalid --stream-port value '{raw}'")))
        .transpose()?;
    let stream_id = matches.opt_str("stream-id");
    let init_args: Vec<wire::Value> = match matches.opt_str("init-args") {
        Some(raw) => {
            let parsed: Vec<serde_json::Value> =
                serde_json::from_str(&raw).context("parsing --init-args JSON")?;
            config::args_to_values(&parsed)
        }
        None => Vec::new(),
    };

    stderrlog::new()
        .module(module_path!())
        .verbosity(3)
        .init()
        .context("initializing logging")?;

    let factory = worker::types::lookup(&kind_name)?;
    let context = worker::types::WorkerContext {
        name: name.clone(),
        config_dir: params_dir.clone(),
        stream_port,
        stream_id,
        init_args,
    };
    let mut params = settings::ParameterSet::load_layers(&params_dir, factory.layers())
        .with_context(|| format!("loading parameter layers for worker type '{kind_name}'"))?;
    let kind = factory.build(&context, &mut params)?;

    let (command_rx, response_tx) = worker::ipc::stdio_worker_link();
    let frame_source: Box<dyn frame_bus::FrameSource> = Box::new(
        frame_bus::BusFrameSource::connect(&bus).context("connecting worker to frame bus")?,
    );

    worker::run_worker_loop(
        &name,
        kind,
        params,
        command_rx,
        response_tx,
        frame_source,
        worker::RuntimeConfig {
            poll_timeout: Duration::from_millis(50),
        },
    );
    Ok(())
}
