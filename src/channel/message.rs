use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Object-safe close surface for channels referenced from message payloads, so
/// payload types do not have to name a channel's generic parameters.
pub trait AttachedChannel: Send + Sync {
    /// Whether the channel has already been closed.
    fn is_closed(&self) -> bool;
    /// Close the channel.
    fn close(&self);
}

/// Contract for channel message payloads.
///
/// `attachments` lists channels embedded in the payload (a reply channel
/// riding along with a request, say). Once a message is fully consumed or
/// dropped across all of its consumers, any attachment still open is closed so
/// an abandoned message cannot leak the channels it carries.
pub trait Payload: Send + Sync + 'static {
    /// Channels embedded in this payload. Defaults to none.
    fn attachments(&self) -> Vec<Arc<dyn AttachedChannel>> {
        Vec::new()
    }
}

/// One queued message. Broadcast shares a single instance across all target
/// channels; `remaining` tracks how many of them still owe a release.
pub(crate) struct Message<M> {
    payload: M,
    remaining: AtomicUsize,
    timeout: Option<Duration>,
}

impl<M: Payload> Message<M> {
    pub(crate) fn new(payload: M, consumers: usize, timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            payload,
            remaining: AtomicUsize::new(consumers),
            timeout,
        })
    }

    pub(crate) fn payload(&self) -> &M {
        &self.payload
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Record that one consumer is finished with this message, whether it was
    /// handled or discarded. The final release closes open attachments.
    pub(crate) fn release(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            discard(&self.payload);
        }
    }
}

/// Close any open channel attached to a payload that will never be consumed.
pub(crate) fn discard<M: Payload>(payload: &M) {
    for channel in payload.attachments() {
        if !channel.is_closed() {
            channel.close();
        }
    }
}
