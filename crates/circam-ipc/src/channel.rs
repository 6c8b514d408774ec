//! Out-of-band event delivery from pipeline threads to the session owner.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::events::SessionEvent;
use crate::EVENT_CHANNEL_CAPACITY;

/// Identifies one subscription on a [`ControlChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A consumer's end of the control channel.
pub struct Subscription {
    id: SubscriberId,
    rx: Receiver<SessionEvent>,
}

impl Subscription {
    /// Id to pass to [`ControlChannel::unsubscribe`].
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The event receiver.
    pub fn receiver(&self) -> &Receiver<SessionEvent> {
        &self.rx
    }

    /// Collect all pending events without blocking.
    pub fn drain(&self) -> Vec<SessionEvent> {
        self.rx.try_iter().collect()
    }
}

struct Subscriber {
    id: SubscriberId,
    tx: Sender<SessionEvent>,
}

/// Ordered, non-blocking fan-out of [`SessionEvent`]s.
///
/// Emitting never blocks: a full subscriber loses the event (counted in
/// [`ControlChannel::dropped`]) and a disconnected subscriber is removed.
/// Once closed, emitted events are discarded without error.
pub struct ControlChannel {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl ControlChannel {
    /// Create an open channel with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a new consumer.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY);
        self.subscribers.write().push(Subscriber { id, tx });
        debug!(subscriber = id.0, "Subscribed to session events");
        Subscription { id, rx }
    }

    /// Remove a consumer. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.write().retain(|s| s.id != id);
        debug!(subscriber = id.0, "Unsubscribed from session events");
    }

    /// Deliver an event to every subscriber without blocking.
    pub fn emit(&self, event: SessionEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut disconnected = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscriber = subscriber.id.0,
                            kind = event.kind(),
                            "Subscriber full, dropping event"
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => disconnected.push(subscriber.id),
                }
            }
        }

        if !disconnected.is_empty() {
            self.subscribers
                .write()
                .retain(|s| !disconnected.contains(&s.id));
        }
    }

    /// Stop delivering events. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.subscribers.write().clear();
            debug!("Control channel closed");
        }
    }

    /// Returns true once [`ControlChannel::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Events lost to full subscribers.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}
