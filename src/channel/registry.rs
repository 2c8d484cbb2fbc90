use super::message::Message;
use super::{
    Channel, ChannelHooks, ChannelOptions, Closer, Handler, NoopHooks, Offer, OfferError, Payload,
};
use crate::executor::Executor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Routing table from broadcast key to the open channels registered under it.
///
/// Every channel is opened through a registry; anonymous channels simply skip
/// registration. The registry is an explicit value with no global state, so a
/// process can run several independent channel domains side by side.
pub struct ChannelRegistry<K, M, R> {
    me: Weak<Self>,
    routes: RwLock<HashMap<K, Vec<Arc<Channel<K, M, R>>>>>,
}

impl<K, M, R> ChannelRegistry<K, M, R>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    M: Payload,
    R: Send + 'static,
{
    /// An empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            routes: RwLock::new(HashMap::new()),
        })
    }

    /// Open a channel drained by `executor`. A `Some` key in `options`
    /// registers the channel for broadcast under that key until it closes.
    pub fn open(
        &self,
        executor: Arc<Executor>,
        options: ChannelOptions<K>,
        handler: Handler<M, R>,
        closer: Option<Closer<R>>,
    ) -> Arc<Channel<K, M, R>> {
        self.open_observed(executor, options, handler, closer, Arc::new(NoopHooks))
    }

    /// [open](Self::open) with lifecycle hooks attached.
    pub fn open_observed(
        &self,
        executor: Arc<Executor>,
        options: ChannelOptions<K>,
        handler: Handler<M, R>,
        closer: Option<Closer<R>>,
        hooks: Arc<dyn ChannelHooks>,
    ) -> Arc<Channel<K, M, R>> {
        Channel::open_in(self, executor, options, handler, closer, hooks)
    }

    pub(crate) fn weak(&self) -> Weak<Self> {
        self.me.clone()
    }

    /// Channels currently registered under `key`.
    pub fn lookup(&self, key: &K) -> Vec<Arc<Channel<K, M, R>>> {
        self.routes.read().get(key).cloned().unwrap_or_default()
    }

    /// Offer one message or control signal to every channel registered under
    /// `key`.
    ///
    /// Returns `Ok(false)` with no side effects when nothing is registered.
    /// A message is shared across all targets and counts as released only
    /// once every one of them has consumed or dropped it; `Shutdown` and
    /// `Error` fan out as control signals. Returns `Ok(true)` if at least one
    /// channel handled the offer.
    pub fn broadcast(
        &self,
        key: &K,
        offer: Offer<M>,
        timeout: Option<Duration>,
    ) -> Result<bool, OfferError> {
        let targets = self.lookup(key);
        if targets.is_empty() {
            return Ok(false);
        }
        match offer {
            Offer::Message(payload) => {
                let message = Message::new(payload, targets.len(), timeout);
                let mut taken = false;
                for channel in &targets {
                    taken = channel.offer_message(Arc::clone(&message))? || taken;
                }
                Ok(taken)
            }
            Offer::Shutdown => {
                for channel in &targets {
                    channel.close();
                }
                Ok(true)
            }
            Offer::Error(e) => {
                let shared = Arc::new(e);
                for channel in &targets {
                    channel.producer_error(Arc::clone(&shared));
                }
                Ok(true)
            }
        }
    }

    pub(crate) fn register(&self, key: K, channel: Arc<Channel<K, M, R>>) {
        self.routes.write().entry(key).or_default().push(channel);
    }

    pub(crate) fn deregister(&self, key: &K, channel: &Channel<K, M, R>) {
        let mut routes = self.routes.write();
        if let Some(channels) = routes.get_mut(key) {
            channels.retain(|c| !std::ptr::eq(Arc::as_ptr(c), channel));
            if channels.is_empty() {
                routes.remove(key);
            }
        }
    }
}

