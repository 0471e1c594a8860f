//! Fixed-size worker pools
//!
//! A `Fiber` is N threads, each draining its own FIFO channel. Jobs are
//! assigned round-robin, so jobs landing on the same worker run in the
//! order they were enqueued.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool with per-worker queues
pub struct Fiber {
    name: String,
    senders: Mutex<Vec<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
    size: usize,
}

impl Fiber {
    /// Spawn `threads` workers named `{name}-{index}`
    pub fn new(name: &str, threads: usize) -> io::Result<Self> {
        let size = threads.max(1);
        let mut senders = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = mpsc::channel::<Job>();
            let thread_name = format!("{}-{}", name, index);
            let worker = thread::Builder::new().name(thread_name).spawn(move || {
                for job in rx {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!("fiber job panicked");
                    }
                }
            })?;
            senders.push(tx);
            workers.push(worker);
        }

        Ok(Fiber {
            name: name.to_string(),
            senders: Mutex::new(senders),
            workers: Mutex::new(workers),
            next: AtomicUsize::new(0),
            size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Queue a job on the next worker; false once shut down
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.size;
        self.send(index, Box::new(job))
    }

    /// Queue a job on the worker owning `key`
    ///
    /// Jobs with equal keys run one at a time, in enqueue order.
    pub fn enqueue_keyed(&self, key: u64, job: impl FnOnce() + Send + 'static) -> bool {
        let index = (key % self.size as u64) as usize;
        self.send(index, Box::new(job))
    }

    fn send(&self, index: usize, job: Job) -> bool {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        match senders.get(index) {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    /// Stop accepting jobs, let queued ones finish and join the workers
    pub fn shutdown(&self) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for worker in workers {
            // A job that drops the last handle to its own fiber cannot join itself
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}
