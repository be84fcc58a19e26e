// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process worker name -> worker record map. Touched only by the
//! Supervisor and Dispatcher, both running in the control-plane process.

use std::collections::BTreeMap;
use std::process::Child;

use dispatchqos::WorkerLink;
use strsim::levenshtein;

use crate::error::OrchestratorError;

/// Maximum edit distance for a name-suggestion hint on a failed lookup.
const SUGGESTION_THRESHOLD: usize = 3;

/// Everything the control plane tracks about one live worker.
pub struct WorkerRecord {
    pub name: String,
    pub kind: String,
    pub process: Child,
    pub link: WorkerLink,
    pub stream_id: Option<String>,
    pub stream_port: Option<u16>,
}

#[derive(Default)]
pub struct Registry {
    workers: BTreeMap<String, WorkerRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn insert(&mut self, record: WorkerRecord) -> Result<(), OrchestratorError> {
        if self.workers.contains_key(&record.name) {
            return Err(OrchestratorError::NameCollision(record.name));
        }
        self.workers.insert(record.name.clone(), record);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<WorkerRecord, OrchestratorError> {
        self.workers
            .remove(name)
            .ok_or_else(|| self.unknown_worker(name))
    }

    pub fn get(&self, name: &str) -> Result<&WorkerRecord, OrchestratorError> {
        self.workers.get(name).ok_or_else(|| self.unknown_worker(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut WorkerRecord, OrchestratorError> {
        if !self.workers.contains_key(name) {
            return Err(self.unknown_worker(name));
        }
        Ok(self.workers.get_mut(name).expect("checked above"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    /// Builds an `UnknownWorker` error, attaching a name suggestion when a
    /// known name is within edit distance `SUGGESTION_THRESHOLD`.
    fn unknown_worker(&self, name: &str) -> OrchestratorError {
        let suggestion = self
            .workers
            .keys()
            .map(|candidate| (candidate, levenshtein(name, candidate)))
            .filter(|(_, distance)| *distance <= SUGGESTION_THRESHOLD)
            .min_by_key(|(_, distance)| *distance)
            .map(|(candidate, _)| candidate.clone());
        OrchestratorError::UnknownWorker(name.to_string(), suggestion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::process::{Command, Stdio};

    fn dummy_record(name: &str) -> WorkerRecord {
        let process = Command::new("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn /bin/true");
        let (command_tx, _command_rx) = bounded(1);
        let (_response_tx, response_rx) = bounded(1);
        WorkerRecord {
            name: name.to_string(),
            kind: "probe".into(),
            process,
            link: WorkerLink {
                command_tx,
                response_rx,
            },
            stream_id: None,
            stream_port: None,
        }
    }

    #[test]
    fn insert_rejects_duplicate_names() {
        let mut registry = Registry::new();
        registry.insert(dummy_record("W")).unwrap();
        let err = registry.insert(dummy_record("W")).unwrap_err();
        assert!(matches!(err, OrchestratorError::NameCollision(name) if name == "W"));
    }

    #[test]
    fn remove_of_absent_name_suggests_closest_match() {
        let mut registry = Registry::new();
        registry.insert(dummy_record("Saver")).unwrap();
        let err = registry.remove("Savr").unwrap_err();
        match err {
            OrchestratorError::UnknownWorker(name, suggestion) => {
                assert_eq!(name, "Savr");
                assert_eq!(suggestion.as_deref(), Some("Saver"));
            }
            other => panic!("expected UnknownWorker, got {other:?}"),
        }
    }

    #[test]
    fn remove_far_off_name_has_no_suggestion() {
        let mut registry = Registry::new();
        registry.insert(dummy_record("Saver")).unwrap();
        let err = registry.remove("CompletelyDifferent").unwrap_err();
        match err {
            OrchestratorError::UnknownWorker(_, suggestion) => assert!(suggestion.is_none()),
            other => panic!("expected UnknownWorker, got {other:?}"),
        }
    }

    #[test]
    fn list_enumerates_live_workers() {
        let mut registry = Registry::new();
        registry.insert(dummy_record("A")).unwrap();
        registry.insert(dummy_record("B")).unwrap();
        let mut names: Vec<&str> = registry.list().map(|r| r.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["A", "B"]);
    }
}
