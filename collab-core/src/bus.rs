//! Addressed pub/sub message bus.
//!
//! The authority and its clients only ever talk through [`MessageBus`]:
//! `transmit` drops an [`Envelope`] onto the channel named by `envelope.to`,
//! and `receive_messages` registers a handler for one channel. No ordering or
//! delivery guarantee is assumed by callers.
//!
//! [`LocalBus`] is the in-process implementation. Each channel is a tokio
//! broadcast channel; every subscription gets an independent receiver that
//! buffers up to `capacity` envelopes, and a forwarding task that hands them
//! to the handler. Lagging subscribers drop messages instead of blocking the
//! sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::protocol::Envelope;

/// Channel every client listens on for `NewVersion` notifications.
pub const BROADCAST_CHANNEL: &str = "collab:broadcast";

pub type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

pub trait MessageBus: Send + Sync + 'static {
    /// Deliver `envelope` to whoever listens on `envelope.to`.
    fn transmit(&self, envelope: Envelope);

    /// Call `handler` for every envelope sent to `channel` until the returned
    /// subscription is dropped.
    fn receive_messages(&self, channel: &str, handler: MessageHandler) -> Subscription;
}

/// Live registration on a channel. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    token: CancellationToken,
}

impl Subscription {
    /// A subscription tied to `token`; the bus stops delivering once it is
    /// cancelled.
    pub fn new(channel: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            channel: channel.into(),
            token,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stops delivery now instead of at drop.
    pub fn unsubscribe(self) {
        self.token.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub messages_sent: u64,
    pub messages_unrouted: u64,
    pub messages_dropped: u64,
    pub active_channels: usize,
}

/// Lock-free counters; read via [`LocalBus::stats`].
#[derive(Default)]
struct AtomicBusStats {
    messages_sent: AtomicU64,
    messages_unrouted: AtomicU64,
    messages_dropped: AtomicU64,
}

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<Arc<Envelope>>>>>;

fn lock(channels: &Channels) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Arc<Envelope>>>> {
    channels.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process [`MessageBus`].
#[derive(Clone)]
pub struct LocalBus {
    channels: Channels,
    capacity: usize,
    stats: Arc<AtomicBusStats>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl LocalBus {
    /// `capacity` is how many envelopes each subscriber may fall behind
    /// before it starts losing messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBusStats::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.channels)
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_unrouted: self.stats.messages_unrouted.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_channels: self.channel_count(),
        }
    }
}

impl MessageBus for LocalBus {
    fn transmit(&self, envelope: Envelope) {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let delivered = {
            let channels = lock(&self.channels);
            match channels.get(&envelope.to) {
                Some(sender) => {
                    let to = envelope.to.clone();
                    let count = sender.send(Arc::new(envelope)).unwrap_or(0);
                    log::trace!("Bus delivered to {count} subscriber(s) of {to}");
                    count
                }
                None => {
                    log::trace!("Bus has no subscribers for {}", envelope.to);
                    0
                }
            }
        };

        if delivered == 0 {
            self.stats.messages_unrouted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn receive_messages(&self, channel: &str, handler: MessageHandler) -> Subscription {
        let mut rx = {
            let mut channels = lock(&self.channels);
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let token = CancellationToken::new();
        let task_token = token.clone();
        let channels = Arc::clone(&self.channels);
        let stats = Arc::clone(&self.stats);
        let name = channel.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(envelope) => handler(Envelope::clone(&envelope)),
                        Err(RecvError::Lagged(n)) => {
                            stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                            log::warn!("Subscriber on {name} lagged by {n} messages");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            drop(rx);
            let mut channels = lock(&channels);
            if channels
                .get(&name)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                channels.remove(&name);
                log::trace!("Bus channel {name} removed (no subscribers)");
            }
        });

        Subscription::new(channel, token)
    }
}
