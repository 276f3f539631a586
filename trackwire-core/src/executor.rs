//! Serial execution context
//!
//! A [`SerialQueue`] owns one worker thread that runs submitted jobs strictly
//! in submission order. Completions that must not interleave with each other
//! are funnelled through one.

use std::sync::mpsc::{self, Sender};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-threaded FIFO job runner
pub struct SerialQueue {
    name: String,
    sender: Sender<Job>,
}

impl SerialQueue {
    /// Spawn the worker thread. It exits once the queue is dropped and all
    /// submitted jobs have run.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();

        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            });

        if let Err(e) = spawned {
            // Jobs sent to a dead receiver fall back to inline execution
            tracing::error!(queue = %name, error = %e, "Failed to spawn serial queue worker");
        }

        Self { name, sender }
    }

    /// Run `job` on the worker thread after every previously submitted job
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(mpsc::SendError(job)) = self.sender.send(Box::new(job)) {
            tracing::warn!(queue = %self.name, "Serial queue worker gone, running job inline");
            job();
        }
    }
}
