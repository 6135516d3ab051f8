use crate::config::QUEUE_SLOTS_PER_WORKER;
use anyhow::{anyhow, Context, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Work item accepted by a [`WorkerPool`].
pub trait Job: Send + 'static {
    /// Short identity for log lines, taken before the handler runs.
    fn label(&self) -> String;
}

enum Message<J> {
    Job(J),
    /// One per worker; a worker exits after taking it
    Stop,
}

/// Outcome counts once every worker has drained and exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: u64,
    pub failed: u64,
    /// Labels of the failed jobs, in failure order
    pub failures: Vec<String>,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    failures: Mutex<Vec<String>>,
}

impl Counters {
    fn record_failure(&self, label: String) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.push(label);
    }
}

/// Fixed set of threads pulling jobs from a bounded FIFO.
///
/// `submit` blocks while the queue holds `2 × workers` pending jobs. A failing
/// or panicking job is logged with its payload and counted; it never stops the pool.
pub struct WorkerPool<J: Job> {
    name: String,
    sender: Option<SyncSender<Message<J>>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl<J: Job> WorkerPool<J> {
    pub fn new<F>(name: &str, workers: usize, handler: F) -> Result<Self>
    where
        F: Fn(&mut J) -> Result<()> + Send + Sync + 'static,
    {
        let workers = workers.max(1);
        let capacity = workers * QUEUE_SLOTS_PER_WORKER;
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let handler = Arc::new(handler);
        let counters = Arc::new(Counters::default());

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            let counters = Arc::clone(&counters);
            let pool = name.to_string();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, n))
                .spawn(move || work(&pool, &receiver, handler.as_ref(), &counters))
                .with_context(|| format!("Failed to spawn {} worker {}", name, n))?;
            handles.push(handle);
        }

        info!(pool = name, workers = workers, capacity = capacity, "Worker pool started");
        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers: handles,
            counters,
        })
    }

    /// Queues a job, blocking while the queue is full.
    pub fn submit(&self, job: J) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("{} pool is shut down", self.name))?;
        sender
            .send(Message::Job(job))
            .map_err(|_| anyhow!("All {} workers have exited", self.name))
    }

    /// Sends one stop message per worker and waits for all of them, so every
    /// job submitted before this call has run when it returns.
    pub fn finish(mut self) -> PoolReport {
        self.shutdown();
        let failures = match self.counters.failures.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let report = PoolReport {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            failures,
        };
        info!(
            pool = %self.name,
            completed = report.completed,
            failed = report.failed,
            "Worker pool drained"
        );
        report
    }

    fn shutdown(&mut self) {
        if let Some(sender) = self.sender.take() {
            for _ in 0..self.workers.len() {
                if sender.send(Message::Stop).is_err() {
                    break;
                }
            }
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(pool = %self.name, "Worker thread terminated abnormally");
            }
        }
    }
}

impl<J: Job> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        // Reached with workers still running only when `finish` was skipped
        self.shutdown();
    }
}

fn work<J: Job>(
    pool: &str,
    receiver: &Mutex<Receiver<Message<J>>>,
    handler: &(dyn Fn(&mut J) -> Result<()> + Send + Sync),
    counters: &Counters,
) {
    loop {
        let message = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };
        let mut job = match message {
            Ok(Message::Job(job)) => job,
            Ok(Message::Stop) | Err(_) => break,
        };
        let label = job.label();

        match panic::catch_unwind(AssertUnwindSafe(|| handler(&mut job))) {
            Ok(Ok(())) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                error!(pool = pool, job = %label, error = %format!("{:#}", e), "Job failed");
                counters.record_failure(label);
            }
            Err(payload) => {
                error!(pool = pool, job = %label, panic = panic_message(payload.as_ref()), "Job panicked");
                counters.record_failure(label);
            }
        }
    }
    debug!(pool = pool, "Worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
