use crate::interrupt::InterruptToken;
use parking_lot::Mutex;
use std::thread::{self, Thread};
use std::time::Instant;

/// A value settled exactly once and observed by blocking waiters.
///
/// Waiters register their thread handle and park; settling unparks them all.
/// Every wait observes the calling thread's interrupt token, so a scheduled
/// interrupt can break out of the park loop.
pub(crate) struct Promise<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    settled: bool,
    value: Option<T>,
    waiters: Vec<Thread>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitError {
    Interrupted,
    TimedOut,
}

impl<T> Promise<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                settled: false,
                value: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Store `value` and wake all waiters. Only the first settle takes effect.
    pub(crate) fn settle(&self, value: T) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            if state.settled {
                return false;
            }
            state.settled = true;
            state.value = Some(value);
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.unpark();
        }
        true
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.state.lock().settled
    }

    /// Block until settled, the deadline passes, or the calling thread is
    /// interrupted. A stray interrupt that lands after settlement is consumed
    /// so it cannot leak into the caller's next blocking operation.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Result<(), WaitError> {
        let token = InterruptToken::current();
        loop {
            {
                let mut state = self.state.lock();
                if state.settled {
                    token.take_interrupted();
                    return Ok(());
                }
                let me = thread::current();
                if !state.waiters.iter().any(|t| t.id() == me.id()) {
                    state.waiters.push(me);
                }
            }
            if token.take_interrupted() {
                self.forget_waiter();
                return Err(WaitError::Interrupted);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.forget_waiter();
                        return Err(WaitError::TimedOut);
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }

    /// Take the settled value; `None` if unsettled or already taken.
    pub(crate) fn take(&self) -> Option<T> {
        self.state.lock().value.take()
    }

    /// Observe the settled value without consuming it.
    pub(crate) fn with_value<U>(&self, f: impl FnOnce(&T) -> U) -> Option<U> {
        self.state.lock().value.as_ref().map(f)
    }

    fn forget_waiter(&self) {
        let me = thread::current().id();
        self.state.lock().waiters.retain(|t| t.id() != me);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn settles_once() {
        let promise = Promise::new();
        assert!(promise.settle(1));
        assert!(!promise.settle(2));
        promise.wait(None).unwrap();
        assert_eq!(promise.take(), Some(1));
        assert_eq!(promise.take(), None);
    }

    #[test]
    fn wait_deadline_expires() {
        let promise: Promise<()> = Promise::new();
        let deadline = Some(Instant::now() + Duration::from_millis(20));
        assert_eq!(promise.wait(deadline), Err(WaitError::TimedOut));
    }

    #[test]
    fn unparks_waiters_across_threads() {
        let promise = Arc::new(Promise::new());
        let observer = {
            let promise = Arc::clone(&promise);
            thread::spawn(move || {
                promise.wait(None).unwrap();
                promise.with_value(|v| *v)
            })
        };
        thread::sleep(Duration::from_millis(10));
        promise.settle(7);
        assert_eq!(observer.join().unwrap(), Some(7));
    }
}
