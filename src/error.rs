// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error as ThisError;

/// The error taxonomy exposed across the control surface. Library code
/// returns this enum at API boundaries so callers can match on variant
/// rather than parse strings; the `Display` impl is what actually crosses
/// the wire in a `{error}` response body.
#[derive(ThisError, Debug)]
pub enum OrchestratorError {
    #[error("a worker named '{0}' already exists")]
    NameCollision(String),

    #[error("no worker named '{0}' is registered{}", suggestion_suffix(.1))]
    UnknownWorker(String, Option<String>),

    #[error("unknown worker type '{0}'")]
    UnknownWorkerType(String),

    #[error("command '{0}' is not known to worker type '{1}'")]
    UnknownCommand(String, String),

    #[error("setting '{0}' is not an exposed parameter of this worker")]
    UnknownSetting(String),

    #[error("restricted worker type '{0}' cannot be managed by an external caller")]
    RestrictedType(String),

    #[error("all streaming ports are taken")]
    PortsExhausted,

    #[error("cannot execute command '{0}': too many commands in waiting list")]
    TooManyCommands(String),

    #[error("command '{0}' could not be executed in time, terminating worker")]
    DeadlineExceeded(String),

    #[error("worker '{0}' is no longer alive")]
    WorkerDead(String),

    #[error("worker '{0}' is busy; try later")]
    WorkerBusy(String),

    #[error("worker '{0}' crashed: {1}")]
    WorkerCrashed(String, String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(name) => format!(" (did you mean '{name}'?)"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_worker_without_suggestion_has_no_hint() {
        let err = OrchestratorError::UnknownWorker("Savr".into(), None);
        assert_eq!(err.to_string(), "no worker named 'Savr' is registered");
    }

    #[test]
    fn unknown_worker_with_suggestion_mentions_it() {
        let err = OrchestratorError::UnknownWorker("Savr".into(), Some("Saver".into()));
        assert!(err.to_string().contains("Saver"));
    }
}
