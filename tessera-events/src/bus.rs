//! Event bus implementation

use crate::SharedHandler;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tessera_core::{new_entity_id, ContextEvent, ContextId, EventTypeFilter, SubscriptionId};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Default number of events kept in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// Capacity of the lossy observer tap.
const TAP_CAPACITY: usize = 256;

/// What a subscription wants to receive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventSelector {
    pub types: EventTypeFilter,
    /// Only events about this context, when set
    pub context_id: Option<ContextId>,
}

impl EventSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn types(types: EventTypeFilter) -> Self {
        Self {
            types,
            context_id: None,
        }
    }

    pub fn for_context(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn matches(&self, event: &ContextEvent) -> bool {
        self.types.matches(event.event_type)
            && self
                .context_id
                .map_or(true, |id| event.context_id == Some(id))
    }
}

/// Delivery statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

struct Subscriber {
    selector: EventSelector,
    tx: mpsc::UnboundedSender<ContextEvent>,
    /// Channel subscribers count a delivery on enqueue; handler
    /// subscribers count it once the handler returns.
    counts_on_send: bool,
}

struct BusInner {
    subscribers: DashMap<SubscriptionId, Subscriber>,
    history: Mutex<VecDeque<ContextEvent>>,
    history_capacity: usize,
    tap: broadcast::Sender<ContextEvent>,
    counters: Arc<Counters>,
}

/// Publish/subscribe hub for [`ContextEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("stats", &self.stats())
            .finish()
    }
}

impl EventBus {
    pub fn new(history_capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                history: Mutex::new(VecDeque::with_capacity(history_capacity.min(4096))),
                history_capacity: history_capacity.max(1),
                tap,
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    /// Register a handler. Its events are processed one at a time, in order,
    /// on a dedicated task. Must be called from within a tokio runtime.
    pub fn subscribe(&self, selector: EventSelector, handler: SharedHandler) -> SubscriptionId {
        let id = new_entity_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<ContextEvent>();
        let counters = Arc::clone(&self.inner.counters);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event_type = event.event_type;
                match handler.handle(event).await {
                    Ok(()) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscription_id = %id,
                            event_type = %event_type,
                            error = %e,
                            "event handler failed"
                        );
                    }
                }
            }
        });

        self.inner.subscribers.insert(
            id,
            Subscriber {
                selector,
                tx,
                counts_on_send: false,
            },
        );
        debug!(subscription_id = %id, "handler subscribed");
        id
    }

    /// Register a channel subscriber. Dropping the receiver ends the subscription.
    pub fn subscribe_channel(
        &self,
        selector: EventSelector,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ContextEvent>) {
        let id = new_entity_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(
            id,
            Subscriber {
                selector,
                tx,
                counts_on_send: true,
            },
        );
        (id, rx)
    }

    /// Lossy broadcast of every published event, for observers that can
    /// tolerate lag.
    pub fn tap(&self) -> broadcast::Receiver<ContextEvent> {
        self.inner.tap.subscribe()
    }

    /// Remove a subscription. Events already queued are still processed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Publish an event. Non-blocking.
    ///
    /// Returns the number of subscriptions the event was queued for.
    pub fn publish(&self, event: ContextEvent) -> usize {
        let counters = &self.inner.counters;
        counters.published.fetch_add(1, Ordering::Relaxed);
        self.record(&event);
        let _ = self.inner.tap.send(event.clone());

        let mut queued = 0;
        let mut closed = Vec::new();
        for entry in self.inner.subscribers.iter() {
            if !entry.selector.matches(&event) {
                continue;
            }
            match entry.tx.send(event.clone()) {
                Ok(()) => {
                    queued += 1;
                    if entry.counts_on_send {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(_) => closed.push(*entry.key()),
            }
        }

        for id in closed {
            self.inner.subscribers.remove(&id);
            counters.failed.fetch_add(1, Ordering::Relaxed);
            debug!(subscription_id = %id, "dropped closed subscriber");
        }

        debug!(
            event_type = %event.event_type,
            context_id = ?event.context_id,
            receivers = queued,
            "published event"
        );
        queued
    }

    fn record(&self, event: &ContextEvent) {
        let mut history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if history.len() == self.inner.history_capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<ContextEvent> {
        self.inner
            .history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Recent events about one context, oldest first.
    pub fn history_for(&self, context_id: ContextId) -> Vec<ContextEvent> {
        self.history()
            .into_iter()
            .filter(|e| e.context_id == Some(context_id))
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            subscribers: self.inner.subscribers.len(),
        }
    }
}
