use super::PoolCore;
use crate::common::promise::{Promise, WaitError};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// This enumeration is the list of the possible error outcomes for
/// [join](JobHandle::join) and [join_timeout](JobHandle::join_timeout).
#[derive(Debug, Error)]
pub enum JoinError {
    /// The task panicked; the payload message is preserved.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The joining thread was interrupted before the task settled.
    #[error("interrupted while waiting for a task")]
    Interrupted,
    /// The timeout elapsed before the task settled.
    #[error("timed out waiting for a task")]
    TimedOut,
    /// The executor shut down before the task ever ran.
    #[error("executor shut down before the task ran")]
    Cancelled,
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

/// Type-erased view of a task, the unit the backlog queue and workers handle.
pub(crate) trait RunTask: Send + Sync {
    fn run(&self);
    fn cancel(&self);
}

pub(crate) struct Task<T> {
    state: AtomicU8,
    func: Mutex<Option<Box<dyn FnOnce() -> T + Send>>>,
    done: Promise<Result<T, JoinError>>,
}

impl<T: Send + 'static> Task<T> {
    pub(crate) fn new(f: impl FnOnce() -> T + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            func: Mutex::new(Some(Box::new(f))),
            done: Promise::new(),
        })
    }

    fn started(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    /// Exactly one caller wins the transition out of PENDING.
    fn claim(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<T: Send + 'static> RunTask for Task<T> {
    fn run(&self) {
        if !self.claim() {
            return;
        }
        let func = match self.func.lock().take() {
            Some(func) => func,
            None => unreachable!("claimed task has no function"),
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(func))
            .map_err(|payload| JoinError::Panicked(panic_message(payload.as_ref())));
        self.state.store(DONE, Ordering::Release);
        self.done.settle(outcome);
    }

    fn cancel(&self) {
        if self.claim() {
            self.func.lock().take();
            self.state.store(DONE, Ordering::Release);
            self.done.settle(Err(JoinError::Cancelled));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

/// Handle to a task submitted to an [Executor](super::Executor).
///
/// Joining a handle whose task has not started while the pool's backlog is
/// non-empty runs the task on the joining thread instead of blocking for a
/// worker. That is what makes recursive submit-and-join chains deeper than the
/// pool safe: a would-be-blocked thread turns into an extra worker.
pub struct JobHandle<T> {
    pub(crate) task: Arc<Task<T>>,
    pub(crate) pool: Arc<PoolCore>,
}

impl<T: Send + 'static> JobHandle<T> {
    /// Block until the task settles and return its result.
    pub fn join(self) -> Result<T, JoinError> {
        if self.should_inline() {
            self.task.run();
        }
        self.wait(None)
    }

    /// [join](Self::join) with an upper bound on the wait.
    ///
    /// An inline run is bounded too: a one-shot interrupt of the calling
    /// thread is scheduled first and cancelled once the run returns, so a task
    /// stuck in a blocking operation cannot pin the joiner past its timeout.
    pub fn join_timeout(self, timeout: Duration) -> Result<T, JoinError> {
        let deadline = Instant::now() + timeout;
        if self.should_inline() {
            let _scheduled = self.pool.interrupts.schedule_current(timeout);
            self.task.run();
        }
        self.wait(Some(deadline))
    }

    /// Whether the task has settled, without blocking.
    pub fn is_finished(&self) -> bool {
        self.task.done.is_settled()
    }

    fn should_inline(&self) -> bool {
        !self.task.started() && !self.pool.backlog_is_empty()
    }

    fn wait(self, deadline: Option<Instant>) -> Result<T, JoinError> {
        match self.task.done.wait(deadline) {
            Ok(()) => {}
            Err(WaitError::Interrupted) => return Err(JoinError::Interrupted),
            Err(WaitError::TimedOut) => return Err(JoinError::TimedOut),
        }
        match self.task.done.take() {
            Some(outcome) => outcome,
            None => unreachable!("settled task has no outcome"),
        }
    }
}
