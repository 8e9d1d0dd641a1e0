/// Broadcaster - best-effort pub/sub fan-out over named channels
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use super::types::{Channel, StreamMessage};
use crate::types::BroadcastConfig;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamMessage>,
    /// Consecutive failed sends
    failures: u32,
}

/// Fan-out registry. Each subscriber owns a bounded queue, so a slow or dead
/// consumer only ever loses its own messages.
pub struct Broadcaster {
    subscribers: Arc<RwLock<HashMap<Channel, Vec<Subscriber>>>>,
    capacity: usize,
    max_failures: u32,
    next_id: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastStats {
    pub subscribers: HashMap<String, usize>,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
}

impl Broadcaster {
    pub fn new(capacity: usize, max_failures: u32) -> Self {
        Broadcaster {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            max_failures: max_failures.max(1),
            next_id: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &BroadcastConfig) -> Self {
        Self::new(config.subscriber_capacity, config.max_send_failures)
    }

    /// Register a new subscriber. Only messages published from now on are seen.
    pub async fn subscribe(&self, channel: Channel) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write().await;
        subscribers.entry(channel).or_default().push(Subscriber {
            id,
            tx,
            failures: 0,
        });

        debug!(channel = channel.as_str(), subscriber = id, "Subscriber registered");

        Subscription { id, channel, rx }
    }

    /// Deliver `message` to every current subscriber of `channel`.
    /// Returns how many subscribers accepted it.
    pub async fn publish(&self, channel: Channel, message: StreamMessage) -> usize {
        let mut subscribers = self.subscribers.write().await;

        let Some(slots) = subscribers.get_mut(&channel) else {
            return 0;
        };

        let mut delivered = 0;
        let max_failures = self.max_failures;

        slots.retain_mut(|slot| match slot.tx.try_send(message.clone()) {
            Ok(()) => {
                slot.failures = 0;
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                slot.failures += 1;
                self.dropped.fetch_add(1, Ordering::Relaxed);

                if slot.failures >= max_failures {
                    warn!(
                        channel = channel.as_str(),
                        subscriber = slot.id,
                        failures = slot.failures,
                        "Evicting subscriber after repeated send failures"
                    );
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    true
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(channel = channel.as_str(), subscriber = slot.id, "Subscriber went away");
                self.evicted.fetch_add(1, Ordering::Relaxed);
                false
            }
        });

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);

        delivered
    }

    pub async fn subscriber_count(&self, channel: Channel) -> usize {
        let subscribers = self.subscribers.read().await;
        subscribers.get(&channel).map(Vec::len).unwrap_or(0)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let subscribers = self.subscribers.read().await;

        BroadcastStats {
            subscribers: Channel::ALL
                .iter()
                .map(|c| {
                    let count = subscribers.get(c).map(Vec::len).unwrap_or(0);
                    (c.as_str().to_string(), count)
                })
                .collect(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    channel: Channel,
    rx: mpsc::Receiver<StreamMessage>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Wait for the next message. `None` once the subscriber has been evicted.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamMessage> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = StreamMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
