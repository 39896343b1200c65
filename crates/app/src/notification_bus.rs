//! In-process notification bus.
//!
//! Every registered [`Subscriber`] gets a dedicated delivery worker fed by
//! an unbounded channel. Publishing only enqueues, so the synchronizer never
//! waits on a subscriber, and a handler that fails or panics only affects its
//! own worker. The bus keeps a weak reference to each subscriber: dropping
//! the last strong reference is as good as unregistering.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use itemhub_domain::error::HubError;
use itemhub_domain::event::StateChangedEvent;
use itemhub_domain::id::SubscriberId;
use itemhub_domain::tracking::TrackingRules;

use crate::ports::Subscriber;

type Batch = Arc<[StateChangedEvent]>;

struct Registration {
    name: String,
    filtered: bool,
    sender: mpsc::UnboundedSender<Batch>,
    worker: JoinHandle<()>,
}

pub struct NotificationBus {
    rules: Arc<TrackingRules>,
    subscribers: Mutex<BTreeMap<SubscriberId, Registration>>,
}

impl NotificationBus {
    #[must_use]
    pub fn new(rules: Arc<TrackingRules>) -> Self {
        Self {
            rules,
            subscribers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a subscriber and spawn its delivery worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, subscriber: &Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId::new();
        let name = subscriber.name().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(deliver(id, Arc::downgrade(subscriber), receiver));
        let registration = Registration {
            name: name.clone(),
            filtered: subscriber.filtered(),
            sender,
            worker,
        };
        self.lock().insert(id, registration);
        tracing::debug!(subscriber_id = %id, subscriber = %name, "subscriber registered");
        id
    }

    /// Returns `false` when the id was not registered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(registration) => {
                tracing::debug!(subscriber_id = %id, subscriber = %registration.name, "subscriber unregistered");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Enqueue a batch of events for every subscriber.
    ///
    /// Filtered subscribers get the batch after tracking rules and equality
    /// suppression; the others get it unchanged.
    pub fn publish(&self, events: Vec<StateChangedEvent>) {
        if events.is_empty() {
            return;
        }
        let filtered: Batch = events
            .iter()
            .filter(|event| !self.rules.suppresses(event))
            .cloned()
            .collect();
        let raw: Batch = events.into();

        let targets: Vec<(SubscriberId, bool, mpsc::UnboundedSender<Batch>)> = self
            .lock()
            .iter()
            .map(|(id, r)| (*id, r.filtered, r.sender.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, is_filtered, sender) in targets {
            let batch = if is_filtered { &filtered } else { &raw };
            if batch.is_empty() {
                continue;
            }
            if sender.send(Arc::clone(batch)).is_err() {
                closed.push(id);
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self.lock();
            for id in closed {
                subscribers.remove(&id);
                tracing::debug!(subscriber_id = %id, "subscriber dropped, registration pruned");
            }
        }
    }

    /// Stop every worker after it drained what was already enqueued.
    pub async fn shutdown(&self) {
        let registrations: Vec<Registration> = std::mem::take(&mut *self.lock()).into_values().collect();
        for Registration { name, sender, worker, .. } in registrations {
            drop(sender);
            if let Err(err) = worker.await {
                tracing::warn!(%err, subscriber = %name, "subscriber worker ended abnormally");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SubscriberId, Registration>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn deliver(
    id: SubscriberId,
    subscriber: Weak<dyn Subscriber>,
    mut receiver: mpsc::UnboundedReceiver<Batch>,
) {
    while let Some(batch) = receiver.recv().await {
        let Some(subscriber) = subscriber.upgrade() else {
            break;
        };
        let outcome = AssertUnwindSafe(subscriber.on_state_changed(&batch))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(%err, subscriber_id = %id, subscriber = subscriber.name(), "subscriber failed to handle events");
            }
            Err(_) => {
                tracing::error!(subscriber_id = %id, subscriber = subscriber.name(), "subscriber panicked while handling events");
            }
        }
    }
}

/// Subscriber forwarding every event to a broadcast channel, for outer
/// surfaces that prefer a [`Stream`].
pub struct ChannelSubscriber {
    name: String,
    sender: broadcast::Sender<StateChangedEvent>,
}

impl ChannelSubscriber {
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.sender.subscribe()
    }

    /// Events published after the call. Lagging receivers skip what they
    /// missed.
    pub fn stream(&self) -> impl Stream<Item = StateChangedEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(Result::ok)
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_state_changed(&self, events: &[StateChangedEvent]) -> Result<(), HubError> {
        for event in events {
            // no receiver is not an error
            let _ = self.sender.send(event.clone());
        }
        Ok(())
    }
}
