//! # Asynchronous message channels
//!
//! A [Channel] is a bounded message queue with exactly one active consumer
//! slot: producers [offer](Channel::offer) payloads, an [OverflowPolicy]
//! decides what happens when the queue is full, and a shared
//! [Executor](crate::executor::Executor) drains the queue through the
//! channel's handler, never on more than one thread at a time.
//!
//! Scheduling is cooperative: a dirty flag, flipped under its own lock, tracks
//! whether a drain is already pending or running. Only the producer that flips
//! the flag submits a drain task, so any number of channels can share a small
//! pool without dedicating a thread to any of them.

mod hooks;
mod message;
mod queue;
mod registry;


pub use hooks::{ChannelHooks, NoopHooks};
pub use message::{AttachedChannel, Payload};
pub use registry::ChannelRegistry;

use crate::common::promise::{Promise, WaitError};
use crate::executor::Executor;
use crate::interrupt::InterruptToken;
use message::Message;
use parking_lot::Mutex;
use queue::{MessageQueue, PushError};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

/// Boxed error carried by handler, closer, and producer-side failure signals.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handler callback, invoked once per drained message.
pub type Handler<M, R> = Box<dyn Fn(&M) -> Result<R, BoxError> + Send + Sync>;

/// Closer callback, invoked at most once at terminal close with the last
/// handler result.
pub type Closer<R> = Box<dyn Fn(Option<R>) -> Result<Option<R>, BoxError> + Send + Sync>;

/// Behavior when a channel's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Reject the newest message.
    Drop,
    /// Discard the oldest queued messages until the newest fits.
    Evict,
    /// Wait for room up to the offer timeout; failing to enqueue is fatal.
    Block,
}

/// One unit of producer input: a payload or an in-band control signal.
pub enum Offer<M> {
    /// An ordinary message.
    Message(M),
    /// Graceful close: stop accepting, but drain what is already queued.
    Shutdown,
    /// Producer-side failure: close the channel and purge its queue.
    Error(BoxError),
}

/// Terminal outcome recorded by a channel. Cloneable so that every completion
/// waiter can observe it.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The handler returned an error.
    #[error("message handler failed: {0}")]
    Handler(Arc<BoxError>),
    /// The closer (or a `close_after` action) returned an error.
    #[error("channel closer failed: {0}")]
    Closer(Arc<BoxError>),
    /// A producer signalled failure through [Offer::Error].
    #[error("producer signalled an error: {0}")]
    Producer(Arc<BoxError>),
    /// A blocking offer was interrupted.
    #[error("interrupted while enqueueing on a blocking channel")]
    Interrupted,
    /// A blocking offer timed out.
    #[error("timed out enqueueing on a blocking channel")]
    OfferTimedOut,
    /// The channel was cancelled through [Channel::cancel].
    #[error("channel cancelled")]
    Cancelled,
}

/// This enumeration is the list of the possible error outcomes for a blocking
/// [offer](Channel::offer); both are recorded as fatal on the channel before
/// propagating.
#[derive(Debug, Error)]
pub enum OfferError {
    /// The wait for queue space was interrupted.
    #[error("interrupted while waiting for queue space")]
    Interrupted,
    /// The wait for queue space timed out.
    #[error("timed out waiting for queue space")]
    TimedOut,
}

/// Failure to observe a channel's completion.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The channel terminated with an error.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// The waiting thread was interrupted.
    #[error("interrupted while waiting for completion")]
    Interrupted,
    /// The wait timed out; the channel itself is unaffected.
    #[error("timed out waiting for completion")]
    TimedOut,
}

/// Construction parameters for [ChannelRegistry::open].
pub struct ChannelOptions<K> {
    /// Broadcast key; `None` opens an anonymous channel.
    pub key: Option<K>,
    /// Queue capacity; 0 is effectively unbounded.
    pub capacity: usize,
    /// Behavior when the queue is full.
    pub policy: OverflowPolicy,
}

impl<K> ChannelOptions<K> {
    /// Options for an anonymous channel.
    pub fn anonymous(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            key: None,
            capacity,
            policy,
        }
    }

    /// Options for a channel registered for broadcast under `key`.
    pub fn keyed(key: K, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            key: Some(key),
            capacity,
            policy,
        }
    }
}

/// A keyed or anonymous bounded message queue with exactly one active
/// consumer slot. Opened through [ChannelRegistry::open].
pub struct Channel<K, M, R> {
    me: Weak<Self>,
    key: Option<K>,
    queue: MessageQueue<Arc<Message<M>>>,
    policy: OverflowPolicy,
    handler: Handler<M, R>,
    closer: Option<Closer<R>>,
    hooks: Arc<dyn ChannelHooks>,
    closed: AtomicBool,
    halted: AtomicBool,
    dirty: AtomicBool,
    dirty_lock: Mutex<()>,
    drain: Mutex<DrainState<R>>,
    running: Mutex<Option<InterruptToken>>,
    last_error: Mutex<Option<ChannelError>>,
    finalized: AtomicBool,
    done: Promise<Result<Option<R>, ChannelError>>,
    executor: Arc<Executor>,
    registry: Weak<ChannelRegistry<K, M, R>>,
}

struct DrainState<R> {
    last_result: Option<R>,
}

impl<K, M, R> Channel<K, M, R>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    M: Payload,
    R: Send + 'static,
{
    pub(crate) fn open_in(
        registry: &ChannelRegistry<K, M, R>,
        executor: Arc<Executor>,
        options: ChannelOptions<K>,
        handler: Handler<M, R>,
        closer: Option<Closer<R>>,
        hooks: Arc<dyn ChannelHooks>,
    ) -> Arc<Self> {
        let channel = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            key: options.key,
            queue: MessageQueue::new(options.capacity),
            policy: options.policy,
            handler,
            closer,
            hooks,
            closed: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            dirty_lock: Mutex::new(()),
            drain: Mutex::new(DrainState { last_result: None }),
            running: Mutex::new(None),
            last_error: Mutex::new(None),
            finalized: AtomicBool::new(false),
            done: Promise::new(),
            executor,
            registry: registry.weak(),
        });
        if let Some(key) = &channel.key {
            registry.register(key.clone(), Arc::clone(&channel));
        }
        channel.hooks.channel_opened(channel.key.is_some());
        debug!(keyed = channel.key.is_some(), "channel opened");
        channel
    }

    /// The broadcast key, if any.
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// Whether the channel has been closed (gracefully or not).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of messages currently queued.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// The recorded terminal error, if the channel failed.
    pub fn last_error(&self) -> Option<ChannelError> {
        self.last_error.lock().clone()
    }

    /// Enqueue a message or control signal.
    ///
    /// Returns `Ok(true)` when the offer was handled: the message was accepted
    /// into the queue, or the channel transitioned as the intended effect of a
    /// control signal. Returns `Ok(false)` when the message was rejected
    /// without error (queue full under `Drop`, or the channel is already
    /// closed); rejections are reported through the drop hook.
    ///
    /// `timeout` applies only to the `Block` policy; `None` waits
    /// indefinitely. A blocking offer that times out or is interrupted closes
    /// the channel and propagates the failure to the caller.
    pub fn offer(&self, offer: Offer<M>, timeout: Option<Duration>) -> Result<bool, OfferError> {
        if self.is_closed() {
            self.hooks.message_dropped();
            if let Offer::Message(payload) = &offer {
                message::discard(payload);
            }
            return Ok(false);
        }
        match offer {
            Offer::Shutdown => {
                self.close();
                Ok(true)
            }
            Offer::Error(e) => {
                self.error_condition(ChannelError::Producer(Arc::new(e)), true);
                Ok(true)
            }
            Offer::Message(payload) => self.offer_message(Message::new(payload, 1, timeout)),
        }
    }

    pub(crate) fn offer_message(&self, message: Arc<Message<M>>) -> Result<bool, OfferError> {
        if self.is_closed() {
            self.hooks.message_dropped();
            message.release();
            return Ok(false);
        }
        if let Err(rejected) = self.queue.try_push(Arc::clone(&message)) {
            match self.policy {
                OverflowPolicy::Drop => {
                    self.hooks.message_dropped();
                    message.release();
                    return Ok(false);
                }
                OverflowPolicy::Evict => {
                    let mut pending = rejected;
                    loop {
                        if let Some(oldest) = self.queue.pop() {
                            self.hooks.message_evicted();
                            oldest.release();
                        }
                        match self.queue.try_push(pending) {
                            Ok(()) => break,
                            Err(back) => pending = back,
                        }
                    }
                }
                OverflowPolicy::Block => {
                    let deadline = message.timeout().map(|t| Instant::now() + t);
                    if let Err(failure) = self.queue.push_wait(rejected, deadline) {
                        let (recorded, propagated, rejected) = match failure {
                            PushError::Interrupted(m) => {
                                (ChannelError::Interrupted, OfferError::Interrupted, m)
                            }
                            PushError::TimedOut(m) => {
                                (ChannelError::OfferTimedOut, OfferError::TimedOut, m)
                            }
                        };
                        self.hooks.message_dropped();
                        rejected.release();
                        self.error_condition(recorded, true);
                        return Err(propagated);
                    }
                }
            }
        }
        self.hooks.message_enqueued();
        self.mark_dirty();
        Ok(true)
    }

    /// Close the channel. Idempotent; messages already queued are still
    /// drained before the completion signal settles.
    pub fn close(&self) {
        self.close_inner(true, false);
    }

    /// Run `f`, then close. An error from `f` becomes the channel's terminal
    /// error instead.
    pub fn close_after<F>(&self, f: F)
    where
        F: FnOnce() -> Result<(), BoxError>,
    {
        match f() {
            Ok(()) => self.close(),
            Err(e) => self.error_condition(ChannelError::Closer(Arc::new(e)), true),
        }
    }

    /// Close and discard the remaining backlog, reporting every discarded
    /// message as dropped. For a handler that no longer wants the rest of its
    /// queue.
    pub fn halt(&self) {
        if self
            .halted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.close_inner(true, true);
        }
    }

    /// Record [ChannelError::Cancelled] and close, unless already closed.
    pub fn cancel(&self) {
        if !self.is_closed() {
            self.error_condition(ChannelError::Cancelled, true);
        }
    }

    /// Block until the channel settles and return the final handler/closer
    /// result.
    pub fn wait(&self) -> Result<Option<R>, CompletionError>
    where
        R: Clone,
    {
        self.wait_deadline(None)
    }

    /// [wait](Self::wait), giving up after `timeout`. Timing out leaves the
    /// channel running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<R>, CompletionError>
    where
        R: Clone,
    {
        self.wait_deadline(Some(Instant::now() + timeout))
    }

    fn wait_deadline(&self, deadline: Option<Instant>) -> Result<Option<R>, CompletionError>
    where
        R: Clone,
    {
        match self.done.wait(deadline) {
            Ok(()) => {}
            Err(WaitError::Interrupted) => return Err(CompletionError::Interrupted),
            Err(WaitError::TimedOut) => return Err(CompletionError::TimedOut),
        }
        match self.done.with_value(Clone::clone) {
            Some(Ok(result)) => Ok(result),
            Some(Err(failure)) => Err(CompletionError::Channel(failure)),
            None => unreachable!("settled channel has no outcome"),
        }
    }

    pub(crate) fn producer_error(&self, e: Arc<BoxError>) {
        self.error_condition(ChannelError::Producer(e), true);
    }

    fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn close_inner(&self, mark_dirty: bool, clear_queue: bool) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!("channel closing");
        if let (Some(key), Some(registry)) = (self.key.as_ref(), self.registry.upgrade()) {
            registry.deregister(key, self);
        }
        if clear_queue {
            for message in self.queue.drain_all() {
                self.hooks.message_dropped();
                message.release();
            }
        }
        if mark_dirty {
            self.mark_dirty();
        }
    }

    fn error_condition(&self, failure: ChannelError, mark_dirty: bool) {
        error!(error = %failure, "channel error");
        *self.last_error.lock() = Some(failure);
        self.close_inner(mark_dirty, true);
        if mark_dirty {
            if let Some(token) = self.running.lock().as_ref() {
                token.interrupt();
            }
        }
    }

    /// Record that the queue has work and schedule a drain if none is
    /// outstanding. Only the thread that flips the flag submits, so at most
    /// one drain submission is ever outstanding per channel no matter how many
    /// producers race here.
    fn mark_dirty(&self) {
        let submit = {
            let _guard = self.dirty_lock.lock();
            self.dirty
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        };
        if submit {
            if let Some(channel) = self.me.upgrade() {
                self.executor.submit(move || channel.run_drain());
            }
        }
    }

    /// Dequeue the next message; an empty queue clears the dirty flag under
    /// the dirty lock, so a producer racing in right after will schedule a
    /// fresh drain rather than strand its message.
    fn poll(&self) -> Option<Arc<Message<M>>> {
        let _guard = self.dirty_lock.lock();
        let message = self.queue.pop();
        if message.is_none() {
            let _ = self
                .dirty
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire);
        }
        message
    }

    /// Drain loop, run on the executor. The drain mutex keeps at most one
    /// execution in flight per channel; the submission discipline in
    /// `mark_dirty` keeps at most one submission outstanding.
    fn run_drain(&self) {
        let mut state = self.drain.lock();
        *self.running.lock() = Some(InterruptToken::current());
        while !self.halted() {
            let message = match self.poll() {
                Some(message) => message,
                None => break,
            };
            let started = Instant::now();
            match (self.handler)(message.payload()) {
                Ok(result) => {
                    state.last_result = Some(result);
                    self.hooks.message_processed(started.elapsed());
                    message.release();
                }
                Err(e) => {
                    message.release();
                    self.error_condition(ChannelError::Handler(Arc::new(e)), false);
                    break;
                }
            }
        }
        *self.running.lock() = None;
        InterruptToken::current().take_interrupted();
        if self.is_closed() {
            self.finalize(&mut state);
        }
    }

    fn finalize(&self, state: &mut DrainState<R>) {
        if self
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // offers that slipped past the closed check after the final drain
        for message in self.queue.drain_all() {
            self.hooks.message_dropped();
            message.release();
        }
        let mut last = state.last_result.take();
        let mut failure = self.last_error.lock().clone();
        if let Some(closer) = &self.closer {
            match closer(last.take()) {
                Ok(result) => last = result,
                Err(e) => failure = Some(ChannelError::Closer(Arc::new(e))),
            }
        }
        let outcome = match failure {
            Some(failure) => Err(failure),
            None => Ok(last),
        };
        self.hooks.channel_closed();
        if self.done.settle(outcome) {
            debug!("channel closed");
        }
    }
}

impl<K, M, R> AttachedChannel for Channel<K, M, R>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    M: Payload,
    R: Send + 'static,
{
    fn is_closed(&self) -> bool {
        Channel::is_closed(self)
    }

    fn close(&self) {
        Channel::close(self);
    }
}
