//! # Deadlock-avoiding worker pool
//!
//! A bounded thread pool for potentially blocking, potentially recursive
//! workloads. Two escape hatches keep recursive submit-and-join chains from
//! starving the pool:
//!
//! - joining an unstarted task while the backlog is non-empty runs the task
//!   inline on the joining thread (see [JobHandle]);
//! - submitting to a saturated backlog runs the task inline on the submitting
//!   thread rather than rejecting it.
//!
//! The pool owns no daemon machinery: call [shutdown](Executor::shutdown) when
//! done, or the worker threads keep waiting for work.

mod task;

#[cfg(test)]
mod test;

pub use task::{JobHandle, JoinError};

use crate::common::promise::Promise;
use crate::interrupt::{InterruptService, InterruptToken};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle as ThreadHandle};
use std::time::{Duration, Instant};
use task::{RunTask, Task};
use tracing::debug;

pub(crate) struct PoolCore {
    backlog_tx: Mutex<Option<Sender<Arc<dyn RunTask>>>>,
    backlog_rx: Receiver<Arc<dyn RunTask>>,
    pub(crate) interrupts: Arc<InterruptService>,
    live_workers: AtomicUsize,
    worker_tokens: Mutex<Vec<InterruptToken>>,
    terminated: Promise<()>,
}

impl PoolCore {
    pub(crate) fn backlog_is_empty(&self) -> bool {
        self.backlog_rx.is_empty()
    }
}

/// Bounded worker pool whose handles can run their task on the joining thread.
pub struct Executor {
    core: Arc<PoolCore>,
    workers: Mutex<Vec<ThreadHandle<()>>>,
}

impl Executor {
    /// Pool sized to the available CPUs, with a backlog of 100 slots per
    /// worker.
    pub fn new(interrupts: Arc<InterruptService>) -> Self {
        let threads = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);
        Self::with_capacity(interrupts, threads, threads * 100)
    }

    /// Pool with an explicit worker count and backlog bound.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is zero or the OS refuses to spawn a worker.
    pub fn with_capacity(
        interrupts: Arc<InterruptService>,
        threads: usize,
        backlog: usize,
    ) -> Self {
        assert!(threads > 0, "executor needs at least one worker");
        let (backlog_tx, backlog_rx) = bounded(backlog.max(1));
        let core = Arc::new(PoolCore {
            backlog_tx: Mutex::new(Some(backlog_tx)),
            backlog_rx,
            interrupts,
            live_workers: AtomicUsize::new(threads),
            worker_tokens: Mutex::new(Vec::with_capacity(threads)),
            terminated: Promise::new(),
        });
        let workers = (0..threads)
            .map(|i| {
                let core = Arc::clone(&core);
                thread::Builder::new()
                    .name(format!("dispatchq-worker-{i}"))
                    .spawn(move || worker_loop(&core))
                    .expect("failed to spawn executor worker")
            })
            .collect();
        Self {
            core,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a task, returning a handle to its eventual result.
    ///
    /// When the backlog is saturated (or the pool is shut down) the task runs
    /// on the calling thread before this returns and the handle comes back
    /// already settled; submissions are never lost.
    pub fn submit<T, F>(&self, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let task = Task::new(f);
        let handle = JobHandle {
            task: Arc::clone(&task),
            pool: Arc::clone(&self.core),
        };
        let pending: Arc<dyn RunTask> = task;
        let sender = self.core.backlog_tx.lock().clone();
        let rejected = match sender {
            Some(tx) => match tx.try_send(pending) {
                Ok(()) => None,
                Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                    Some(task)
                }
            },
            None => Some(pending),
        };
        if let Some(task) = rejected {
            task.run();
        }
        handle
    }

    /// Stop intake and let the workers drain the backlog. Tasks still queued
    /// when `grace` expires are cancelled (their handles settle with
    /// [JoinError::Cancelled]) and the workers are interrupted.
    pub fn shutdown(&self, grace: Duration) {
        let Some(sender) = self.core.backlog_tx.lock().take() else {
            return;
        };
        debug!("executor shutting down");
        drop(sender);
        let deadline = Instant::now() + grace;
        if self.core.terminated.wait(Some(deadline)).is_err() {
            debug!("executor grace period expired, cancelling queued tasks");
            while let Ok(task) = self.core.backlog_rx.try_recv() {
                task.cancel();
            }
            for token in self.core.worker_tokens.lock().iter() {
                token.interrupt();
            }
        }
        if self.core.terminated.is_settled() {
            for worker in self.workers.lock().drain(..) {
                let _ = worker.join();
            }
        }
    }
}

fn worker_loop(core: &Arc<PoolCore>) {
    core.worker_tokens.lock().push(InterruptToken::current());
    while let Ok(task) = core.backlog_rx.recv() {
        task.run();
        // a task may leave an unconsumed interrupt behind; the next task
        // should not inherit it
        InterruptToken::current().take_interrupted();
    }
    if core.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        core.terminated.settle(());
    }
}
