//! Topic-keyed publish/subscribe seam used for progress fan-out.
//!
//! `DeliveryChannel` is the transport contract; `LocalDeliveryChannel` is an
//! in-process implementation that delivers synchronously on the caller's
//! task, honoring per-subscription de-duplication and a trailing debounce
//! keyed by the message `type` field.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use intake_core::model::AssessmentId;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::runtime::{lock, spawn_after};

/// Callback invoked with each delivered message.
pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by `DeliveryChannel::subscribe`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscriber-side delivery preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscribeOptions {
    /// Trailing debounce window; zero delivers every message at once.
    pub debounce: Duration,
    /// Skip a message identical to the last one delivered to this subscriber.
    pub deduplicate: bool,
}

/// Where a broadcast goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub topic: String,
    pub assessment_id: Option<AssessmentId>,
}

impl Routing {
    #[must_use]
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            assessment_id: None,
        }
    }

    /// Routing onto the `progress-{id}` topic of an assessment.
    #[must_use]
    pub fn for_assessment(id: &AssessmentId) -> Self {
        Self {
            topic: id.progress_topic(),
            assessment_id: Some(id.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Publisher-side delivery flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryOptions {
    pub priority: Priority,
    /// Bypass subscriber debounce; anything pending is flushed first.
    pub immediate: bool,
}

impl DeliveryOptions {
    #[must_use]
    pub fn high() -> Self {
        Self {
            priority: Priority::High,
            immediate: false,
        }
    }

    #[must_use]
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }
}

/// Generic publish/subscribe transport keyed by topic.
pub trait DeliveryChannel: Send + Sync {
    fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> SubscriptionId;

    /// Returns `false` when the subscription was unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn broadcast(&self, message: Value, routing: &Routing, options: DeliveryOptions);
}

//
// ─── LOCAL CHANNEL ─────────────────────────────────────────────────────────────
//

struct Subscriber {
    topic: String,
    handler: MessageHandler,
    options: SubscribeOptions,
    last_delivered: Option<Value>,
    /// Latest undelivered message per `type`, in first-arrival order.
    pending: Vec<(String, Value)>,
    timer: Option<JoinHandle<()>>,
}

impl Subscriber {
    fn accept(&mut self, message: Value) -> Option<Value> {
        if self.options.deduplicate && self.last_delivered.as_ref() == Some(&message) {
            return None;
        }
        self.last_delivered = Some(message.clone());
        Some(message)
    }

    fn stage(&mut self, message: Value) {
        let kind = message_kind(&message);
        match self.pending.iter_mut().find(|(k, _)| *k == kind) {
            Some(slot) => slot.1 = message,
            None => self.pending.push((kind, message)),
        }
    }

    fn drain_pending(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .filter_map(|(_, message)| self.accept(message))
            .collect()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct ChannelInner {
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber>>,
}

/// In-process `DeliveryChannel`.
#[derive(Clone, Default)]
pub struct LocalDeliveryChannel {
    inner: Arc<ChannelInner>,
}

impl LocalDeliveryChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.inner.subscribers)
            .values()
            .filter(|s| s.topic == topic)
            .count()
    }
}

fn message_kind(message: &Value) -> String {
    message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

async fn flush_pending(inner: Arc<ChannelInner>, id: SubscriptionId) {
    let delivery = {
        let mut subscribers = lock(&inner.subscribers);
        subscribers.get_mut(&id).map(|sub| {
            sub.timer = None;
            (Arc::clone(&sub.handler), sub.drain_pending())
        })
    };
    if let Some((handler, messages)) = delivery {
        for message in messages {
            handler(&message);
        }
    }
}

impl DeliveryChannel for LocalDeliveryChannel {
    fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.inner.subscribers).insert(
            id,
            Subscriber {
                topic: topic.to_owned(),
                handler,
                options,
                last_delivered: None,
                pending: Vec::new(),
                timer: None,
            },
        );
        debug!(topic, subscription_id = %id, "channel subscription opened");
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = lock(&self.inner.subscribers).remove(&id);
        match removed {
            Some(mut sub) => {
                sub.cancel_timer();
                debug!(topic = %sub.topic, subscription_id = %id, "channel subscription closed");
                true
            }
            None => false,
        }
    }

    fn broadcast(&self, message: Value, routing: &Routing, options: DeliveryOptions) {
        let mut deliveries: Vec<(MessageHandler, Value)> = Vec::new();
        {
            let mut subscribers = lock(&self.inner.subscribers);
            for (id, sub) in subscribers
                .iter_mut()
                .filter(|(_, sub)| sub.topic == routing.topic)
            {
                if options.immediate || sub.options.debounce.is_zero() {
                    sub.cancel_timer();
                    for pending in sub.drain_pending() {
                        deliveries.push((Arc::clone(&sub.handler), pending));
                    }
                    if let Some(message) = sub.accept(message.clone()) {
                        deliveries.push((Arc::clone(&sub.handler), message));
                    }
                    continue;
                }

                sub.stage(message.clone());
                sub.cancel_timer();
                sub.timer = spawn_after(
                    sub.options.debounce,
                    flush_pending(Arc::clone(&self.inner), *id),
                );
                if sub.timer.is_none() {
                    // Outside a runtime there is nothing to debounce on.
                    for pending in sub.drain_pending() {
                        deliveries.push((Arc::clone(&sub.handler), pending));
                    }
                }
            }
        }

        debug!(
            topic = %routing.topic,
            priority = ?options.priority,
            delivered = deliveries.len(),
            "broadcast"
        );
        for (handler, message) in deliveries {
            handler(&message);
        }
    }
}
