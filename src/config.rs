// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Layered configuration: CLI flags (`getopts`) override the static
//! worker-configuration file (`serde_yaml`) that the Supervisor loads once
//! at startup. Mirrors the original's `argparse` + `yaml.safe_load` split.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::frame_bus::BusEndpoint;
use crate::wire::Value;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_BUS_PORT: u16 = 6379;
pub const DEFAULT_CHANNEL: &str = "video-streamer";
pub const DEFAULT_CONTROL_PORT: u16 = 50051;
pub const DEFAULT_STREAM_PORT_RANGE: (u16, u16) = (9000, 9016);
pub const MIN_MAX_WAIT: std::time::Duration = std::time::Duration::from_millis(50);

/// One entry of the worker-configuration file's `worker_classes` map: which
/// implementation a type name resolves to (`location` is informational only
/// in this rewrite: the actual resolution is `worker::types::lookup`) and
/// whether external control-plane callers may start/terminate it.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerClassConfig {
    pub location: String,
    #[serde(default)]
    pub accessible: bool,
}

/// One entry of the `processes` list: a worker the Supervisor starts
/// immediately at startup, and which a restricted worker's protected-restart
/// path replays verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// The worker-configuration file as a whole (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfigFile {
    pub modules_path: String,
    pub worker_classes: BTreeMap<String, WorkerClassConfig>,
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
}

impl WorkerConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading worker configuration file {}", path.display()))?;
        let parsed: WorkerConfigFile = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing worker configuration file {}", path.display()))?;
        for process in &parsed.processes {
            if !parsed.worker_classes.contains_key(&process.kind) {
                bail!(
                    "process '{}' declares unknown worker type '{}'",
                    process.name,
                    process.kind
                );
            }
        }
        Ok(parsed)
    }
}

/// Process args as they cross the wire: converted from raw JSON to the
/// closed `Value` type once, at load time, with the same scalar-coercion
/// rule the control surface's `settings`/`args` payloads use.
pub fn args_to_values(args: &[serde_json::Value]) -> Vec<Value> {
    args.iter().map(Value::coerce_from_wire).collect()
}

/// Fully resolved runtime configuration: CLI flags layered over the static
/// worker-configuration file.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub bus: BusEndpoint,
    pub control_host: String,
    pub control_port: u16,
    pub config_file: PathBuf,
    pub params_dir: PathBuf,
    pub stream_port_range: (u16, u16),
    pub verbosity: usize,
}

impl OrchestratorConfig {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut opts = getopts::Options::new();
        opts.optopt("", "host", "host of the frame bus", "HOST");
        opts.optopt("", "port", "port of the frame bus", "PORT");
        opts.optopt("", "channel", "channel of the video stream", "CHANNEL");
        opts.optopt("c", "config", "worker configuration file path", "PATH");
        opts.optopt("", "params-dir", "directory of per-type parameter layer files", "PATH");
        opts.optopt("", "control-host", "host the control surface listens on", "HOST");
        opts.optopt("", "control-port", "port the control surface listens on", "PORT");
        opts.optflagmulti("v", "verbose", "increase logging verbosity (repeatable)");
        opts.optflag("h", "help", "print this help text and exit");

        let matches = opts.parse(args).context("parsing command line flags")?;
        if matches.opt_present("h") {
            bail!("{}", opts.usage("Usage: workerd [options]"));
        }

        let config_file = matches
            .opt_str("config")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("configs/workers.yaml"));
        let params_dir = matches
            .opt_str("params-dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("configs/params"));

        let port = match matches.opt_str("port") {
            Some(raw) => raw.parse().with_context(|| format!("invalid --port value '{raw}'"))?,
            None => DEFAULT_BUS_PORT,
        };
        let control_port = match matches.opt_str("control-port") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid --control-port value '{raw}'"))?,
            None => DEFAULT_CONTROL_PORT,
        };

        Ok(OrchestratorConfig {
            bus: BusEndpoint {
                host: matches.opt_str("host").unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port,
                channel: matches.opt_str("channel").unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            },
            control_host: matches
                .opt_str("control-host")
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            control_port,
            config_file,
            params_dir,
            stream_port_range: DEFAULT_STREAM_PORT_RANGE,
            verbosity: matches.opt_count("v"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn cli_flags_override_defaults() {
        let config = OrchestratorConfig::from_args(&[
            "--host".to_string(),
            "bus.example".to_string(),
            "--port".to_string(),
            "7000".to_string(),
            "-v".to_string(),
            "-v".to_string(),
        ])
        .unwrap();
        assert_eq!(config.bus.host, "bus.example");
        assert_eq!(config.bus.port, 7000);
        assert_eq!(config.verbosity, 2);
    }

    #[test]
    fn loads_worker_configuration_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workers.yaml");
        fs::write(
            &path,
            r#"
modules_path: workerd.worker.types
worker_classes:
  probe:
    location: probe.ProbeWorker
    accessible: true
  sentinel:
    location: sentinel.SentinelWorker
    accessible: false
processes:
  - name: W
    type: probe
    args: []
"#,
        )
        .unwrap();

        let config = WorkerConfigFile::load(&path).unwrap();
        assert_eq!(config.processes.len(), 1);
        assert!(config.worker_classes["probe"].accessible);
        assert!(!config.worker_classes["sentinel"].accessible);
    }

    #[test]
    fn rejects_process_with_unknown_type() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workers.yaml");
        fs::write(
            &path,
            r#"
modules_path: x
worker_classes: {}
processes:
  - name: W
    type: ghost
"#,
        )
        .unwrap();
        assert!(WorkerConfigFile::load(&path).is_err());
    }
}
