//! # Timed thread interrupts
//!
//! Threads cannot be interrupted from the outside, so interruption here is a
//! cooperative token: a per-thread flag plus the thread's handle. Interrupting
//! sets the flag and unparks the thread; every blocking wait in this crate is
//! a park loop that consumes the flag and bails out with an interruption
//! error.
//!
//! [InterruptService] is the scheduling half: a single dedicated thread that
//! fires "interrupt token T after delay D" requests, each cancellable until it
//! fires. The executor uses it to bound inline task execution inside a timed
//! join.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cooperative interrupt state for one thread.
///
/// Cheap to clone; all clones for a thread share the same flag.
#[derive(Clone)]
pub struct InterruptToken {
    inner: Arc<TokenState>,
}

struct TokenState {
    flag: AtomicBool,
    thread: Thread,
}

thread_local! {
    static CURRENT: InterruptToken = InterruptToken {
        inner: Arc::new(TokenState {
            flag: AtomicBool::new(false),
            thread: thread::current(),
        }),
    };
}

impl InterruptToken {
    /// The calling thread's token.
    pub fn current() -> Self {
        CURRENT.with(Clone::clone)
    }

    /// Set the interrupt flag and unpark the owning thread.
    pub fn interrupt(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.thread.unpark();
    }

    /// Whether the flag is set, without consuming it.
    pub fn is_interrupted(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Consume the flag. Blocking waits call this once per wakeup.
    pub fn take_interrupted(&self) -> bool {
        self.inner.flag.swap(false, Ordering::AcqRel)
    }
}

enum Command {
    Schedule {
        id: u64,
        at: Instant,
        token: InterruptToken,
    },
    Cancel {
        id: u64,
    },
    Shutdown,
}

/// Single-thread scheduler for cancellable delayed interrupts.
pub struct InterruptService {
    tx: Sender<Command>,
    next_id: AtomicU64,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// Handle for one scheduled interrupt; cancels when dropped.
pub struct ScheduledInterrupt {
    id: u64,
    tx: Sender<Command>,
}

impl ScheduledInterrupt {
    /// Cancel the pending interrupt. Has no effect if it already fired.
    pub fn cancel(self) {}
}

impl Drop for ScheduledInterrupt {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Cancel { id: self.id });
    }
}

impl InterruptService {
    /// Spawn the scheduler thread.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn the thread.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let scheduler = thread::Builder::new()
            .name("dispatchq-interrupt".into())
            .spawn(move || run_scheduler(&rx))
            .expect("failed to spawn interrupt scheduler");
        Self {
            tx,
            next_id: AtomicU64::new(1),
            scheduler: Mutex::new(Some(scheduler)),
        }
    }

    /// Arrange for `token` to be interrupted after `delay`.
    pub fn schedule(&self, token: InterruptToken, delay: Duration) -> ScheduledInterrupt {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Command::Schedule {
            id,
            at: Instant::now() + delay,
            token,
        });
        ScheduledInterrupt {
            id,
            tx: self.tx.clone(),
        }
    }

    /// Arrange for the calling thread to be interrupted after `delay`.
    pub fn schedule_current(&self, delay: Duration) -> ScheduledInterrupt {
        self.schedule(InterruptToken::current(), delay)
    }

    /// Stop the scheduler thread, discarding pending interrupts. Idempotent.
    pub fn shutdown(&self) {
        if let Some(handle) = self.scheduler.lock().take() {
            debug!("interrupt service shutting down");
            let _ = self.tx.send(Command::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Default for InterruptService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_scheduler(rx: &Receiver<Command>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut pending: HashMap<u64, InterruptToken> = HashMap::new();
    loop {
        let now = Instant::now();
        while let Some(&Reverse((at, id))) = deadlines.peek() {
            if at > now {
                break;
            }
            deadlines.pop();
            if let Some(token) = pending.remove(&id) {
                token.interrupt();
            }
        }
        let command = match deadlines.peek() {
            Some(&Reverse((at, _))) => match rx.recv_deadline(at) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
        };
        match command {
            Command::Schedule { id, at, token } => {
                pending.insert(id, token);
                deadlines.push(Reverse((at, id)));
            }
            Command::Cancel { id } => {
                pending.remove(&id);
            }
            Command::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::promise::{Promise, WaitError};

    #[test]
    fn scheduled_interrupt_wakes_a_parked_wait() {
        let service = Arc::new(InterruptService::new());
        let promise: Arc<Promise<()>> = Arc::new(Promise::new());
        let waiter = {
            let service = Arc::clone(&service);
            let promise = Arc::clone(&promise);
            thread::spawn(move || {
                let _scheduled = service.schedule_current(Duration::from_millis(30));
                promise.wait(None)
            })
        };
        assert_eq!(waiter.join().unwrap(), Err(WaitError::Interrupted));
    }

    #[test]
    fn cancelled_interrupts_do_not_fire() {
        let service = InterruptService::new();
        let token = InterruptToken::current();
        service
            .schedule(token.clone(), Duration::from_millis(20))
            .cancel();
        thread::sleep(Duration::from_millis(80));
        assert!(!token.is_interrupted());
    }

    #[test]
    fn interrupt_flag_is_consumed_once() {
        let token = InterruptToken::current();
        token.interrupt();
        assert!(token.is_interrupted());
        assert!(token.take_interrupted());
        assert!(!token.take_interrupted());
        // soak up the unpark credit left by interrupt()
        thread::park_timeout(Duration::from_millis(1));
    }
}
