//! Broadcaster - ordered one-to-many fan-out of change events
//!
//! Every operation (subscribe, unsubscribe, yield, close) runs under one
//! mutex, and lifecycle signals are queued while that mutex is held. A batch
//! is therefore delivered to the subscriber set as it existed at one instant,
//! and signals arrive in the order the subscriber count changed.
//!
//! Delivery is synchronous: `yield_batch` pushes into each subscriber's
//! unbounded queue on the caller's thread. There is no task hop between the
//! platform callback and the queues.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use fanwatch_core::ChangeEvent;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{debug, trace};

/// Subscriber-count transitions observed by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// 0 -> 1 subscribers
    FirstSubscriberAdded,
    /// 1 -> 0 subscribers
    LastSubscriberRemoved,
}

pub type LifecycleSignals = mpsc::UnboundedReceiver<LifecycleSignal>;

/// Registration id; ids increase with registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct State {
    next_id: u64,
    subscribers: BTreeMap<SubscriberId, mpsc::UnboundedSender<ChangeEvent>>,
    lifecycle: mpsc::UnboundedSender<LifecycleSignal>,
    closed: bool,
}

impl State {
    fn signal(&self, signal: LifecycleSignal) {
        trace!("Lifecycle signal: {:?}", signal);
        // Nobody observing is fine.
        let _ = self.lifecycle.send(signal);
    }
}

struct Shared {
    state: Mutex<State>,
    lifecycle_rx: Mutex<Option<LifecycleSignals>>,
}

#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

/// Non-owning handle, used by the watch callback so that a running source
/// never keeps its broadcaster alive
#[derive(Clone)]
pub struct WeakBroadcaster {
    shared: Weak<Shared>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (lifecycle, lifecycle_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_id: 0,
                    subscribers: BTreeMap::new(),
                    lifecycle,
                    closed: false,
                }),
                lifecycle_rx: Mutex::new(Some(lifecycle_rx)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber. On the 0 -> 1 transition the
    /// `FirstSubscriberAdded` signal is queued before this returns.
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let id = SubscriberId(state.next_id);
        state.next_id += 1;

        if state.closed {
            // Sender dropped here: the stream ends immediately.
            return Subscription {
                id,
                receiver,
                broadcaster: None,
            };
        }

        let was_empty = state.subscribers.is_empty();
        state.subscribers.insert(id, sender);
        if was_empty {
            state.signal(LifecycleSignal::FirstSubscriberAdded);
        }
        let count = state.subscribers.len();
        drop(state);

        debug!("Subscriber {} registered ({} active)", id, count);
        Subscription {
            id,
            receiver,
            broadcaster: Some(self.clone()),
        }
    }

    /// Deliver a batch, in order, to every registered subscriber in
    /// registration order. Subscribers whose consumer is gone are skipped.
    pub fn yield_batch(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }

        let state = self.lock();
        for (id, sender) in &state.subscribers {
            for event in events {
                if sender.send(event.clone()).is_err() {
                    trace!("Skipping closed subscriber {}", id);
                    break;
                }
            }
        }
        trace!(
            "Yielded {} events to {} subscribers",
            events.len(),
            state.subscribers.len()
        );
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut state = self.lock();
        if state.subscribers.remove(&id).is_none() {
            return false;
        }
        if state.subscribers.is_empty() {
            state.signal(LifecycleSignal::LastSubscriberRemoved);
        }
        let count = state.subscribers.len();
        drop(state);

        debug!("Subscriber {} removed ({} active)", id, count);
        true
    }

    /// Tear down: every subscriber stream ends and later subscriptions are
    /// born closed.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let had_subscribers = !state.subscribers.is_empty();
        state.subscribers.clear();
        if had_subscribers {
            state.signal(LifecycleSignal::LastSubscriberRemoved);
        }
    }

    /// Close only if nobody is subscribed, checked and applied under one
    /// lock. Returns true if the broadcaster is closed afterwards.
    pub fn close_if_empty(&self) -> bool {
        let mut state = self.lock();
        if !state.subscribers.is_empty() {
            return false;
        }
        state.closed = true;
        true
    }

    /// The lifecycle signal sequence. There is exactly one observer: the
    /// first caller gets the receiver, later calls get `None`.
    pub fn lifecycle_signals(&self) -> Option<LifecycleSignals> {
        self.shared
            .lifecycle_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriber_count() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn ptr_eq(&self, other: &Broadcaster) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn downgrade(&self) -> WeakBroadcaster {
        WeakBroadcaster {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl WeakBroadcaster {
    pub fn upgrade(&self) -> Option<Broadcaster> {
        self.shared.upgrade().map(|shared| Broadcaster { shared })
    }

    pub fn is(&self, broadcaster: &Broadcaster) -> bool {
        Weak::ptr_eq(&self.shared, &Arc::downgrade(&broadcaster.shared))
    }
}

/// A consumer's handle: a stream of [`ChangeEvent`]s.
///
/// Dropping or cancelling the handle unsubscribes it. Events already queued
/// can still be drained after a cancel; nothing new arrives.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
    broadcaster: Option<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once cancelled and drained or the broadcaster
    /// was closed
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn is_active(&self) -> bool {
        self.broadcaster.is_some()
    }

    /// Stop listening. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(broadcaster) = self.broadcaster.take() {
            broadcaster.unsubscribe(self.id);
        }
        self.receiver.close();
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChangeEvent>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
