use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::trace;

/// A payload delivered on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub topic: String,
    pub payload: T,
}

/// Receiving half of a bus subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Envelope<T>>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<Envelope<T>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope<T>> {
        self.rx.try_recv().ok()
    }
}

struct Topics<T> {
    by_topic: HashMap<String, Vec<mpsc::UnboundedSender<Envelope<T>>>>,
    wildcard: Vec<mpsc::UnboundedSender<Envelope<T>>>,
}

/// In-process topic bus.
///
/// Every subscriber owns an unbounded queue, so a slow consumer never blocks a
/// publisher or another subscriber. Publishing holds the topic table lock for
/// the whole fan-out, so two payloads published on one topic reach every
/// subscriber in publish order. Queues whose receiver was dropped are pruned on
/// the next publish to that topic.
pub struct EventBus<T> {
    topics: Mutex<Topics<T>>,
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(Topics {
                by_topic: HashMap::new(),
                wildcard: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Topics<T>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `payload` to every live subscriber of `topic` and to every
    /// wildcard subscriber. Returns the number of deliveries.
    pub fn publish(&self, topic: &str, payload: T) -> usize {
        let mut topics = self.lock();
        let mut delivered = 0;

        let envelope = Envelope {
            topic: topic.to_string(),
            payload,
        };
        let mut deliver = |senders: &mut Vec<mpsc::UnboundedSender<Envelope<T>>>| {
            senders.retain(|tx| {
                let ok = tx.send(envelope.clone()).is_ok();
                delivered += usize::from(ok);
                ok
            });
        };

        if let Some(senders) = topics.by_topic.get_mut(topic) {
            deliver(senders);
            if senders.is_empty() {
                topics.by_topic.remove(topic);
            }
        }
        deliver(&mut topics.wildcard);

        trace!(topic, delivered, "Published");
        delivered
    }

    pub fn subscribe(&self, topic: &str) -> Subscription<T> {
        self.subscribe_many([topic])
    }

    /// One subscription receiving every listed topic. Per-topic order holds;
    /// no order is implied between different topics.
    pub fn subscribe_many<I, S>(&self, topics: I) -> Subscription<T>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.lock();
        for topic in topics {
            table
                .by_topic
                .entry(topic.as_ref().to_string())
                .or_default()
                .push(tx.clone());
        }
        Subscription { rx }
    }

    pub fn subscribe_all(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().wildcard.push(tx);
        Subscription { rx }
    }

    /// Live subscribers of `topic`, wildcard subscribers excluded.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .by_topic
            .get(topic)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}
