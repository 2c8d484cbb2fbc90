use crate::interrupt::InterruptToken;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::thread::{self, Thread};
use std::time::Instant;

/// Outcome of a blocking push that did not enqueue.
pub(crate) enum PushError<T> {
    TimedOut(T),
    Interrupted(T),
}

/// Bounded FIFO with a non-blocking fast path and an interruptible blocking
/// push for the `Block` overflow policy. Producers waiting for space park and
/// are unparked by every pop, re-checking capacity under the lock.
pub(crate) struct MessageQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    items: VecDeque<T>,
    space_waiters: Vec<Thread>,
}

impl<T> MessageQueue<T> {
    /// `capacity` 0 means effectively unbounded.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: if capacity == 0 { usize::MAX } else { capacity },
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                space_waiters: Vec::new(),
            }),
        }
    }

    pub(crate) fn try_push(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.items.len() >= self.capacity {
            return Err(item);
        }
        inner.items.push_back(item);
        Ok(())
    }

    /// Block until there is room, the deadline passes, or the calling thread
    /// is interrupted. `None` waits indefinitely.
    pub(crate) fn push_wait(&self, item: T, deadline: Option<Instant>) -> Result<(), PushError<T>> {
        let token = InterruptToken::current();
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.items.len() < self.capacity {
                    inner.items.push_back(item);
                    return Ok(());
                }
                let me = thread::current();
                if !inner.space_waiters.iter().any(|t| t.id() == me.id()) {
                    inner.space_waiters.push(me);
                }
            }
            if token.take_interrupted() {
                self.forget_waiter();
                return Err(PushError::Interrupted(item));
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.forget_waiter();
                        return Err(PushError::TimedOut(item));
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front();
        if item.is_some() {
            for waiter in inner.space_waiters.drain(..) {
                waiter.unpark();
            }
        }
        item
    }

    /// Empty the queue, waking all blocked producers.
    pub(crate) fn drain_all(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let drained = inner.items.drain(..).collect();
        for waiter in inner.space_waiters.drain(..) {
            waiter.unpark();
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    fn forget_waiter(&self) {
        let me = thread::current().id();
        self.inner.lock().space_waiters.retain(|t| t.id() != me);
    }
}
