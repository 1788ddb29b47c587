//! Event bus and channel message bus.
//!
//! Two buses with different jobs:
//!
//! - [`EventBus`] — fire-and-forget observability events. Publication never
//!   blocks the core; handlers run on spawned tasks tracked so `close()`
//!   can drain them.
//! - [`MessageBus`] — `tokio::sync::mpsc` queues that decouple chat
//!   channels from the router, with per-channel outbound subscribers.
//!
//! Subscribers are stored in a shared map so dispatch can run without
//! holding a bus-wide mutex.

pub mod events;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use events::{Event, InboundMessage, OutboundEnvelope};

type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct BusSubscribers {
    typed: RwLock<HashMap<String, Vec<(u64, EventHandler)>>>,
    all: RwLock<Vec<(u64, EventHandler)>>,
}

/// Callback that removes a subscription when invoked.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Fire-and-forget event bus.
pub struct EventBus {
    subscribers: Arc<BusSubscribers>,
    next_id: AtomicU64,
    tracker: TaskTracker,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(BusSubscribers::default()),
            next_id: AtomicU64::new(1),
            tracker: TaskTracker::new(),
        }
    }

    /// Publish an event without blocking.
    ///
    /// Every matching handler runs on its own spawned task; the publisher
    /// never waits for them.
    pub fn publish(&self, event: Event) {
        let mut handlers: Vec<EventHandler> = Vec::new();
        {
            let typed = self.subscribers.typed.read().unwrap();
            if let Some(subs) = typed.get(&event.event_type) {
                handlers.extend(subs.iter().map(|(_, h)| Arc::clone(h)));
            }
        }
        {
            let all = self.subscribers.all.read().unwrap();
            handlers.extend(all.iter().map(|(_, h)| Arc::clone(h)));
        }
        for handler in handlers {
            self.tracker.spawn((*handler)(event.clone()));
        }
    }

    /// Subscribe to one event type. Returns an unsubscribe callback.
    pub fn subscribe<F, Fut>(&self, event_type: &str, handler: F) -> Unsubscribe
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let boxed: EventHandler = Arc::new(move |ev| Box::pin(handler(ev)));
        self.subscribers
            .typed
            .write()
            .unwrap()
            .entry(event_type.to_string())
            .or_default()
            .push((id, boxed));

        let subs = Arc::clone(&self.subscribers);
        let event_type = event_type.to_string();
        Box::new(move || {
            let mut typed = subs.typed.write().unwrap();
            if let Some(list) = typed.get_mut(&event_type) {
                list.retain(|(sub_id, _)| *sub_id != id);
            }
        })
    }

    /// Subscribe to every event type. Returns an unsubscribe callback.
    pub fn subscribe_all<F, Fut>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let boxed: EventHandler = Arc::new(move |ev| Box::pin(handler(ev)));
        self.subscribers.all.write().unwrap().push((id, boxed));

        let subs = Arc::clone(&self.subscribers);
        Box::new(move || {
            subs.all.write().unwrap().retain(|(sub_id, _)| *sub_id != id);
        })
    }

    /// Stop accepting new handler tasks and wait for in-flight ones.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Callback type for outbound message subscribers.
type OutboundCallback = Box<dyn Fn(OutboundEnvelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Shared subscriber map — can be cloned and read without locking the bus.
pub type SubscriberMap = Arc<tokio::sync::RwLock<HashMap<String, Vec<OutboundCallback>>>>;

/// Seconds an outbound subscriber gets before its delivery is abandoned.
const DISPATCH_TIMEOUT_SECS: u64 = 10;

/// Async message bus that decouples chat channels from the router.
///
/// Channels push messages to the inbound sender; the bridge processes them
/// via the inbound receiver. Responses flow back through the outbound
/// channel to per-channel subscribers.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_tx: mpsc::Sender<OutboundEnvelope>,
    subscribers: SubscriberMap,
}

pub struct MessageBusReceivers {
    pub inbound_rx: mpsc::Receiver<InboundMessage>,
    pub outbound_rx: mpsc::Receiver<OutboundEnvelope>,
}

impl MessageBus {
    /// Create a new message bus with the given queue capacity.
    pub fn new(capacity: usize) -> (Self, MessageBusReceivers) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

        (
            Self {
                inbound_tx,
                outbound_tx,
                subscribers: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            },
            MessageBusReceivers {
                inbound_rx,
                outbound_rx,
            },
        )
    }

    /// Cloneable sender for publishing inbound messages.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Publish an outbound envelope.
    pub async fn publish_outbound(&self, envelope: OutboundEnvelope) {
        if let Err(e) = self.outbound_tx.send(envelope).await {
            error!("Failed to publish outbound message: {}", e);
        }
    }

    /// A clone of the subscriber map for use in dispatch or registration.
    pub fn subscribers(&self) -> SubscriberMap {
        Arc::clone(&self.subscribers)
    }

    /// Subscribe to outbound messages for a specific channel.
    pub async fn subscribe_outbound<F, Fut>(&self, channel: &str, callback: F)
    where
        F: Fn(OutboundEnvelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let boxed: OutboundCallback = Box::new(move |msg| Box::pin(callback(msg)));
        let mut subs = self.subscribers.write().await;
        subs.entry(channel.to_string()).or_default().push(boxed);
    }
}

/// Route outbound envelopes to the subscribers of their channel.
///
/// Run as a background task via `tokio::spawn`; it exits when all outbound
/// senders are dropped.
pub async fn dispatch_outbound(
    subscribers: SubscriberMap,
    mut outbound_rx: mpsc::Receiver<OutboundEnvelope>,
) {
    while let Some(envelope) = outbound_rx.recv().await {
        let channel = envelope.channel_name.clone();
        let subs = subscribers.read().await;
        if let Some(callbacks) = subs.get(&channel) {
            for callback in callbacks {
                let fut = callback(envelope.clone());
                if tokio::time::timeout(std::time::Duration::from_secs(DISPATCH_TIMEOUT_SECS), fut)
                    .await
                    .is_err()
                {
                    error!(channel = %channel, "Outbound dispatch timed out");
                }
            }
        } else {
            debug!(channel = %channel, "No subscribers for outbound message");
        }
    }
}
