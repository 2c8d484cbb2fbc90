use std::time::Duration;

/// Pure observers for channel lifecycle and message accounting.
///
/// Every method has a no-op default. Implementations are called from producer
/// threads and from the drain loop, so they must not block meaningfully and
/// must not panic.
pub trait ChannelHooks: Send + Sync {
    /// A message was accepted into the queue.
    fn message_enqueued(&self) {}
    /// The handler finished a message.
    fn message_processed(&self, _elapsed: Duration) {}
    /// A message was rejected, purged, or offered to a closed channel.
    fn message_dropped(&self) {}
    /// A queued message was displaced under the `Evict` policy.
    fn message_evicted(&self) {}
    /// The channel was opened; `keyed` is false for anonymous channels.
    fn channel_opened(&self, _keyed: bool) {}
    /// The channel reached its terminal state.
    fn channel_closed(&self) {}
}

/// Observer that ignores everything; the default for unobserved channels.
pub struct NoopHooks;

impl ChannelHooks for NoopHooks {}
