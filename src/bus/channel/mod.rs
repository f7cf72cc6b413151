//! In-memory channel-based broker for standalone mode.
//!
//! Uses one tokio broadcast channel per topic for pub/sub within a single
//! process. Ideal for local development and testing without external
//! dependencies. An availability switch simulates a broker outage: while
//! unavailable, connect/publish/subscribe fail and live subscriptions
//! observe a transport error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

use super::{Broker, BusError, Record, Result, Subscription};

/// Channel capacity per topic.
const CHANNEL_CAPACITY: usize = 1024;

struct TopicChannel {
    sender: broadcast::Sender<Record>,
    next_offset: i64,
}

impl TopicChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            next_offset: 0,
        }
    }
}

/// In-memory broker using tokio broadcast channels.
///
/// Records published while a topic has no subscribers are dropped. Every
/// subscription receives every record regardless of its group; there is a
/// single partition (0) per topic.
pub struct ChannelBroker {
    topics: RwLock<HashMap<String, TopicChannel>>,
    connected: AtomicBool,
    available: watch::Sender<bool>,
}

impl ChannelBroker {
    /// Create a new, reachable channel broker.
    pub fn new() -> Self {
        let (available, _) = watch::channel(true);

        info!("Channel broker initialized");

        Self {
            topics: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            available,
        }
    }

    /// Simulate the broker going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.send_replace(available);
        info!(available, "Channel broker availability changed");
    }

    /// Whether the simulated broker is reachable.
    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Number of live subscriptions on `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|t| t.sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn connect(&self) -> Result<()> {
        if !self.is_available() {
            return Err(BusError::Unavailable(
                "channel broker is unavailable".to_string(),
            ));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Channel broker producer connected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, _key: Option<&str>, payload: &[u8]) -> Result<()> {
        if !self.is_available() {
            return Err(BusError::Publish("channel broker is unavailable".to_string()));
        }
        if !self.is_connected() {
            return Err(BusError::Publish("producer is not connected".to_string()));
        }

        let mut topics = self.topics.write().await;
        let channel = topics
            .entry(topic.to_string())
            .or_insert_with(TopicChannel::new);

        let record = Record {
            topic: topic.to_string(),
            partition: 0,
            offset: channel.next_offset,
            payload: Some(payload.to_vec()),
        };
        channel.next_offset += 1;

        // Send to channel (ignore error if no receivers)
        match channel.sender.send(record) {
            Ok(receiver_count) => {
                debug!(receivers = receiver_count, "Published record to channel");
            }
            Err(_) => {
                debug!("No subscribers on topic, record dropped");
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str, group_id: &str) -> Result<Box<dyn Subscription>> {
        if !self.is_available() {
            return Err(BusError::Subscribe(
                "channel broker is unavailable".to_string(),
            ));
        }

        let receiver = {
            let mut topics = self.topics.write().await;
            topics
                .entry(topic.to_string())
                .or_insert_with(TopicChannel::new)
                .sender
                .subscribe()
        };

        info!(topic = %topic, group_id = %group_id, "Subscribed to channel topic");

        Ok(Box::new(ChannelSubscription {
            topic: topic.to_string(),
            receiver,
            available: self.available.subscribe(),
        }))
    }
}

/// Subscription over one channel topic.
pub struct ChannelSubscription {
    topic: String,
    receiver: broadcast::Receiver<Record>,
    available: watch::Receiver<bool>,
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn next(&mut self) -> Option<Result<Record>> {
        loop {
            if !*self.available.borrow_and_update() {
                return Some(Err(BusError::Transport(
                    "channel broker connection lost".to_string(),
                )));
            }

            tokio::select! {
                changed = self.available.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                received = self.receiver.recv() => match received {
                    Ok(record) => return Some(Ok(record)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(topic = %self.topic, skipped = n, "Channel subscription lagged, skipped records");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(topic = %self.topic, "Channel closed, ending subscription");
                        return None;
                    }
                },
            }
        }
    }
}
