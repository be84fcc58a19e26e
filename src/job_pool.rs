// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A small bounded thread-pool for long-running I/O-bound side work inside a
//! worker process (encoding a recorded batch to disk, writing a video file)
//! so it never blocks the frame/command loop. Mirrors the original's
//! `concurrent.futures.ThreadPoolExecutor(max_workers=5)`.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads draining a single shared job queue.
pub struct JobPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl JobPool {
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = std::sync::Arc::new(std::sync::Mutex::new(receiver));

        let workers = (0..size.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                thread::spawn(move || loop {
                    let job = {
                        let guard = receiver.lock().expect("job pool mutex poisoned");
                        guard.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => return,
                    }
                })
            })
            .collect();

        JobPool {
            sender: Some(sender),
            workers,
        }
    }

    /// Queues `job` for execution on the next free worker thread.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }

    /// Drops the job sender and waits for every in-flight/queued job to
    /// finish, mirroring `executor.shutdown(wait=True)`.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn runs_submitted_jobs() {
        let pool = JobPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool); // shutdown() blocks until all jobs have run
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn shutdown_waits_for_in_flight_job() {
        let pool = JobPool::new(1);
        let done = Arc::new(AtomicUsize::new(0));
        let done_clone = done.clone();
        pool.submit(move || {
            thread::sleep(Duration::from_millis(50));
            done_clone.store(1, Ordering::SeqCst);
        });
        drop(pool);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
