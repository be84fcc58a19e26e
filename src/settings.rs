// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter schema resolution: loading per-worker-type YAML parameter
//! layers, merging them into internal/exposed maps, and the settings-change
//! validation shared by every worker type's `settings` command.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;

use crate::error::OrchestratorError;
use crate::wire::Value;

#[derive(Debug, Deserialize)]
struct ParameterFile {
    #[serde(default)]
    parameters: BTreeMap<String, ParameterEntry>,
}

#[derive(Debug, Deserialize)]
struct ParameterEntry {
    value: serde_yaml::Value,
    exposed: Option<bool>,
}

/// The merged parameter state for one worker instance: the full internal
/// map plus the subset mutable through the generic `settings` command.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    internal: BTreeMap<String, Value>,
    exposed: BTreeMap<String, Value>,
}

impl ParameterSet {
    /// Resolves a worker type's configuration layers, named most-generic
    /// ancestor first, concrete type last; later layers override earlier
    /// ones. This is the flattened replacement for the inheritance MRO the
    /// original system walks at import time.
    pub fn load_layers(config_dir: &Path, layers: &[&str]) -> Result<Self> {
        let mut internal = BTreeMap::new();
        let mut exposed = BTreeMap::new();

        for layer in layers {
            let path = config_dir.join(format!("{layer}.yaml"));
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading parameter layer {}", path.display()))?;
            let parsed: ParameterFile = serde_yaml::from_str(&contents)
                .with_context(|| format!("parsing parameter layer {}", path.display()))?;

            for (name, entry) in parsed.parameters {
                let is_exposed = entry.exposed.unwrap_or_else(|| {
                    warn!("parameter '{name}' in layer '{layer}' omits `exposed`, defaulting to false");
                    false
                });
                let value = Value::from(yaml_to_json(entry.value));
                internal.insert(name.clone(), value.clone());
                if is_exposed {
                    exposed.insert(name, value);
                } else {
                    exposed.remove(&name);
                }
            }
        }

        Ok(ParameterSet { internal, exposed })
    }

    pub fn internal(&self) -> &BTreeMap<String, Value> {
        &self.internal
    }

    pub fn exposed(&self) -> &BTreeMap<String, Value> {
        &self.exposed
    }

    /// Excludes `key` from the exposed map even if a parameter layer marked
    /// it `exposed: true` (used by worker types, e.g. `recorder`'s
    /// `recording`, that must only ever change through a dedicated command).
    pub fn hide_from_settings(&mut self, key: &str) {
        self.exposed.remove(key);
    }

    /// Validates and applies a settings-change request. Rejects the whole
    /// request if any key is not in the exposed set (all-or-nothing);
    /// `check_conflict` lets the worker type veto the tentative merged view;
    /// `on_change` runs once per key whose value actually changes, in
    /// caller-supplied order, allowing the worker to reset dependent state.
    pub fn apply_settings(
        &mut self,
        requested: &BTreeMap<String, Value>,
        check_conflict: impl FnOnce(&BTreeMap<String, Value>) -> Result<(), String>,
        mut on_change: impl FnMut(&str),
    ) -> Result<(), OrchestratorError> {
        for key in requested.keys() {
            if !self.exposed.contains_key(key) {
                return Err(OrchestratorError::UnknownSetting(key.clone()));
            }
        }

        let mut tentative = self.exposed.clone();
        for (key, value) in requested {
            tentative.insert(key.clone(), value.clone());
        }
        check_conflict(&tentative).map_err(OrchestratorError::Internal)?;

        for (key, value) in requested {
            if self.exposed.get(key) != Some(value) {
                on_change(key);
            }
        }

        for (key, value) in requested {
            self.exposed.insert(key.clone(), value.clone());
            self.internal.insert(key.clone(), value.clone());
        }

        Ok(())
    }
}

fn yaml_to_json(value: serde_yaml::Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}
