//! Bounded-latency command dispatch for single-consumer workers.
//!
//! A [`Dispatcher`] mediates between a bursty set of callers and a worker that
//! processes one command at a time. For each worker there is at most one live
//! [`Manager`]: a background thread that owns a bounded FIFO of pending
//! commands and drives the worker's own command/response channel pair. When
//! the FIFO sits idle it is torn down; the next command creates a fresh one.
//!
//! This crate knows nothing about processes, registries, or settings. It
//! only knows how to bound the time a caller waits for a single command to
//! round-trip through a worker, and how to report back why it didn't.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use log::{debug, warn};
use serde_json::Value;

/// How long a manager thread waits on an empty FIFO before giving up and
/// letting the next command spawn a fresh manager.
const IDLE_SHUTDOWN: Duration = Duration::from_secs(2);

/// Maximum number of commands a single worker's manager will hold pending.
pub const MAX_PENDING_COMMANDS: usize = 20;

/// A command forwarded to a worker: its name and opaque argument payload.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub args: Value,
}

/// What the worker sent back for a command: success value or an error
/// message, exactly as the worker's command table produced it.
pub type CommandResponse = Result<Value, String>;

/// The channel pair a single worker exposes to its manager. Cheap to clone:
/// both ends are `crossbeam_channel` handles.
#[derive(Clone)]
pub struct WorkerLink {
    pub command_tx: Sender<Command>,
    pub response_rx: crossbeam_channel::Receiver<CommandResponse>,
}

/// Why a dispatched command did not produce a normal [`CommandResponse`].
#[derive(Debug)]
pub enum DispatchFailure {
    /// The per-worker FIFO already holds `MAX_PENDING_COMMANDS` entries.
    TooManyPending,
    /// The command sat in the FIFO past its own deadline and was skipped
    /// before ever reaching the worker, or the manager was too busy to get
    /// to it within `max_wait`.
    Busy,
    /// The worker failed to reply within `max_wait` after the command was
    /// actually forwarded to it, or its channel was found disconnected.
    /// The caller is expected to terminate the worker.
    NoReplyInTime,
    /// The manager observed the worker as dead (response channel
    /// disconnected, or a prior command in the same burst already timed
    /// out) before this command could even be forwarded.
    WorkerDead,
}

/// The result of dispatching one command: either the worker's own response
/// (success or a business-logic error from its command table) or a reason
/// the dispatch machinery itself never got a response to hand back.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The worker ran the command and replied, successfully or not.
    Completed(CommandResponse),
    /// The dispatch machinery gave up before producing a worker response.
    Failed(DispatchFailure),
}

impl DispatchOutcome {
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            DispatchOutcome::Completed(Ok(value)) => Ok(value),
            DispatchOutcome::Completed(Err(worker_error)) => Err(worker_error),
            DispatchOutcome::Failed(failure) => Err(format!("{failure:?}")),
        }
    }
}

struct PendingCommand {
    name: String,
    args: Value,
    submitted_at: Instant,
    max_wait: Duration,
    processed_tx: Sender<()>,
    result_tx: Sender<CommandResponse>,
}

struct ManagerSlot {
    fifo_tx: Sender<PendingCommand>,
    generation: u64,
    failed: Arc<AtomicBool>,
}

/// Dispatches commands to a fleet of single-consumer workers, bounding how
/// long any one caller waits for a reply.
pub struct Dispatcher {
    managers: Arc<Mutex<HashMap<String, ManagerSlot>>>,
    next_generation: AtomicU64,
    on_worker_failed: Arc<dyn Fn(&str) + Send + Sync>,
}

impl Dispatcher {
    /// `on_worker_failed` is invoked (from the manager's background thread)
    /// the first time a worker is observed not to reply within `max_wait`,
    /// or to have a disconnected response channel. The embedding crate is
    /// expected to terminate (and possibly restart) the worker from there.
    pub fn new(on_worker_failed: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Dispatcher {
            managers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            on_worker_failed: Arc::new(on_worker_failed),
        }
    }

    /// Submits `command` to `worker_id` via `link`, waiting up to `max_wait`
    /// for the whole round trip (queueing + execution).
    pub fn dispatch(
        &self,
        worker_id: &str,
        link: &WorkerLink,
        command: String,
        args: Value,
        max_wait: Duration,
    ) -> DispatchOutcome {
        let (processed_tx, processed_rx) = bounded::<()>(1);
        let (result_tx, result_rx) = bounded::<CommandResponse>(1);

        let failed = match self.enqueue(
            worker_id,
            link,
            PendingCommand {
                name: command,
                args,
                submitted_at: Instant::now(),
                max_wait,
                processed_tx,
                result_tx,
            },
        ) {
            Ok(failed) => failed,
            Err(failure) => return DispatchOutcome::Failed(failure),
        };

        match processed_rx.recv_timeout(max_wait) {
            Ok(()) => match result_rx.recv_timeout(max_wait) {
                Ok(response) => DispatchOutcome::Completed(response),
                Err(_timeout) => DispatchOutcome::Failed(DispatchFailure::NoReplyInTime),
            },
            Err(_timeout) => {
                if failed.load(Ordering::SeqCst) {
                    DispatchOutcome::Failed(DispatchFailure::WorkerDead)
                } else {
                    DispatchOutcome::Failed(DispatchFailure::Busy)
                }
            }
        }
    }

    fn enqueue(
        &self,
        worker_id: &str,
        link: &WorkerLink,
        pending: PendingCommand,
    ) -> Result<Arc<AtomicBool>, DispatchFailure> {
        let mut managers = self.managers.lock().expect("dispatcher mutex poisoned");

        if let Some(slot) = managers.get(worker_id) {
            match slot.fifo_tx.try_send(pending) {
                Ok(()) => return Ok(slot.failed.clone()),
                Err(TrySendError::Full(_)) => return Err(DispatchFailure::TooManyPending),
                Err(TrySendError::Disconnected(returned)) => {
                    // The manager exited between us reading the slot and
                    // sending to it; fall through and spawn a fresh one.
                    managers.remove(worker_id);
                    return self.spawn_and_enqueue(&mut managers, worker_id, link, returned);
                }
            }
        }

        self.spawn_and_enqueue(&mut managers, worker_id, link, pending)
    }

    fn spawn_and_enqueue(
        &self,
        managers: &mut HashMap<String, ManagerSlot>,
        worker_id: &str,
        link: &WorkerLink,
        pending: PendingCommand,
    ) -> Result<Arc<AtomicBool>, DispatchFailure> {
        let (fifo_tx, fifo_rx) = bounded::<PendingCommand>(MAX_PENDING_COMMANDS);
        let failed = Arc::new(AtomicBool::new(false));
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        fifo_tx
            .try_send(pending)
            .map_err(|_| DispatchFailure::TooManyPending)?;

        managers.insert(
            worker_id.to_string(),
            ManagerSlot {
                fifo_tx,
                generation,
                failed: failed.clone(),
            },
        );

        self.spawn_manager(worker_id.to_string(), link.clone(), fifo_rx, generation, failed.clone());

        Ok(failed)
    }

    fn spawn_manager(
        &self,
        worker_id: String,
        link: WorkerLink,
        fifo_rx: crossbeam_channel::Receiver<PendingCommand>,
        generation: u64,
        failed: Arc<AtomicBool>,
    ) {
        let managers = self.managers.clone();
        let on_worker_failed = self.on_worker_failed.clone();

        thread::spawn(move || {
            run_manager(
                &worker_id,
                &link,
                &fifo_rx,
                &managers,
                generation,
                &failed,
                &on_worker_failed,
            );
        });
    }
}

fn run_manager(
    worker_id: &str,
    link: &WorkerLink,
    fifo_rx: &crossbeam_channel::Receiver<PendingCommand>,
    managers: &Arc<Mutex<HashMap<String, ManagerSlot>>>,
    generation: u64,
    failed: &Arc<AtomicBool>,
    on_worker_failed: &Arc<dyn Fn(&str) + Send + Sync>,
) {
    loop {
        let pending = match fifo_rx.recv_timeout(IDLE_SHUTDOWN) {
            Ok(pending) => pending,
            Err(RecvTimeoutError::Timeout) => {
                debug!("manager for {worker_id} idle, shutting down");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if pending.submitted_at.elapsed() > pending.max_wait {
            debug!(
                "command {} for {worker_id} expired in queue before dispatch",
                pending.name
            );
            continue;
        }

        if link
            .command_tx
            .send(Command {
                name: pending.name.clone(),
                args: pending.args.clone(),
            })
            .is_err()
        {
            warn!("worker {worker_id} command channel disconnected");
            mark_failed(worker_id, failed, on_worker_failed);
            break;
        }

        let _ = pending.processed_tx.send(());

        match link.response_rx.recv_timeout(pending.max_wait) {
            Ok(response) => {
                let _ = pending.result_tx.send(response);
            }
            Err(_) => {
                warn!("worker {worker_id} did not reply to {} in time", pending.name);
                mark_failed(worker_id, failed, on_worker_failed);
                break;
            }
        }
    }

    let mut managers = managers.lock().expect("dispatcher mutex poisoned");
    if let Some(slot) = managers.get(worker_id) {
        if slot.generation == generation {
            managers.remove(worker_id);
        }
    }
}

fn mark_failed(worker_id: &str, failed: &Arc<AtomicBool>, on_worker_failed: &Arc<dyn Fn(&str) + Send + Sync>) {
    if !failed.swap(true, Ordering::SeqCst) {
        on_worker_failed(worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn worker_link(capacity: usize) -> (WorkerLink, crossbeam_channel::Receiver<Command>, Sender<CommandResponse>) {
        let (command_tx, command_rx) = bounded::<Command>(capacity);
        let (response_tx, response_rx) = bounded::<CommandResponse>(capacity);
        (
            WorkerLink {
                command_tx,
                response_rx,
            },
            command_rx,
            response_tx,
        )
    }

    #[test]
    fn happy_dispatch_returns_worker_value() {
        let (link, command_rx, response_tx) = worker_link(1);
        let dispatcher = Dispatcher::new(|_| {});

        let worker = thread::spawn(move || {
            let cmd = command_rx.recv().unwrap();
            assert_eq!(cmd.name, "print");
            response_tx.send(Ok(Value::String("ok".into()))).unwrap();
        });

        let result = dispatcher.dispatch(
            "W",
            &link,
            "print".into(),
            Value::Array(vec![Value::String("hi".into())]),
            Duration::from_secs(2),
        );

        assert!(matches!(
            result,
            DispatchOutcome::Completed(Ok(Value::String(ref s))) if s == "ok"
        ));
        worker.join().unwrap();
    }

    #[test]
    fn worker_error_is_preserved() {
        let (link, command_rx, response_tx) = worker_link(1);
        let dispatcher = Dispatcher::new(|_| {});

        let worker = thread::spawn(move || {
            let _ = command_rx.recv().unwrap();
            response_tx.send(Err("nope is not known".into())).unwrap();
        });

        let result = dispatcher.dispatch("W", &link, "nope".into(), Value::Null, Duration::from_secs(2));
        match result {
            DispatchOutcome::Completed(Err(message)) => assert_eq!(message, "nope is not known"),
            other => panic!("expected a worker-reported error, got {other:?}"),
        }
        worker.join().unwrap();
    }

    #[test]
    fn no_reply_in_time_reports_timeout_and_calls_hook() {
        let (link, command_rx, _response_tx) = worker_link(1);
        let failures = Arc::new(AtomicUsize::new(0));
        let failures_clone = failures.clone();
        let dispatcher = Dispatcher::new(move |_| {
            failures_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Worker receives the command but never replies.
        let worker = thread::spawn(move || {
            let _ = command_rx.recv().unwrap();
        });

        let result = dispatcher.dispatch(
            "W",
            &link,
            "slow".into(),
            Value::Null,
            Duration::from_millis(50),
        );

        assert!(matches!(
            result,
            DispatchOutcome::Failed(DispatchFailure::NoReplyInTime)
        ));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        worker.join().unwrap();
    }

    #[test]
    fn full_fifo_fails_fast() {
        let (link, command_rx, _response_tx) = worker_link(1);
        let dispatcher = Dispatcher::new(|_| {});

        // Tie up the worker so the manager can never drain the FIFO.
        let _command_rx = command_rx;

        for _ in 0..MAX_PENDING_COMMANDS {
            let _ = dispatcher.dispatch(
                "W",
                &link,
                "noop".into(),
                Value::Null,
                Duration::from_millis(5),
            );
        }

        // Give the manager a moment to drain what it can; flood it again
        // faster than it can possibly keep up by never letting the worker
        // consume anything.
        let result = dispatcher.dispatch("W", &link, "noop".into(), Value::Null, Duration::from_millis(0));
        // Either it raced the manager and got queued (then timed out as
        // Busy/NoReplyInTime), or the FIFO was observed full outright.
        // What must never happen is a successful completion: the worker
        // never consumes anything in this test.
        assert!(matches!(result, DispatchOutcome::Failed(_)));
    }
}
