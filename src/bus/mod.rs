//! Message broker access for the relay.
//!
//! This module contains:
//! - `Broker` trait: connect / publish / subscribe against a broker session
//! - `Subscription` trait: pull-based handle over a subscribed topic
//! - Bus configuration types
//! - Implementations: Kafka (feature `kafka`), in-process Channel

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

// Implementation modules
pub mod channel;
#[cfg(feature = "kafka")]
pub mod kafka;

// Re-exports
pub use channel::ChannelBroker;
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaBrokerConfig};

/// Well-known topic carrying blog mutation events.
pub const DEFAULT_TOPIC: &str = "blog-events";
/// Single logical consumer group shared by every relay instance.
pub const DEFAULT_GROUP_ID: &str = "blogGroup";
/// Client identifier presented to the broker.
pub const DEFAULT_CLIENT_ID: &str = "blogService";

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Malformed envelope: {0}")]
    Decode(String),
}

/// One record pulled from a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// Pull handle over a subscribed topic.
///
/// `next` is the only suspension point of a consumer: it resolves with the
/// next record, a transport error (the session was lost and must be
/// re-established), or `None` when the broker closed the subscription.
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Option<Result<Record>>;

    /// Leave the topic. Dropping the handle also releases it.
    fn close(&mut self) {}
}

/// Interface to the message broker session.
///
/// Implementations:
/// - `KafkaBroker`: Apache Kafka via librdkafka
/// - `ChannelBroker`: in-process broadcast channels
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish the producer session. Calling it again while connected is a no-op.
    ///
    /// Fails with `BusError::Unavailable` once the backend's retry policy is exhausted.
    async fn connect(&self) -> Result<()>;

    /// Make a single connect attempt, leaving retries to the caller.
    async fn connect_once(&self) -> Result<()> {
        self.connect().await
    }

    /// Whether `connect` has completed successfully.
    fn is_connected(&self) -> bool;

    /// Publish one payload, resolving only after the broker acknowledged it.
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<()>;

    /// Join `group_id` on `topic` and return a pull handle.
    async fn subscribe(&self, topic: &str, group_id: &str) -> Result<Box<dyn Subscription>>;

    /// Flush pending writes and release the producer session.
    async fn shutdown(&self) {}
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process channels (local development, tests).
    #[default]
    Channel,
    /// Apache Kafka.
    Kafka,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Topic shared by the publisher and the consumer.
    pub topic: String,
    /// Consumer group joined by the relay.
    pub group_id: String,
    /// Kafka-specific configuration.
    pub kafka: KafkaConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Channel,
            topic: DEFAULT_TOPIC.to_string(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            kafka: KafkaConfig::default(),
        }
    }
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Client identifier.
    pub client_id: String,
    /// Start a fresh consumer group at the earliest offset instead of the latest.
    pub from_beginning: bool,
    /// Producer acknowledgment level (`0`, `1`, `all`).
    pub acks: String,
    /// Upper bound for a produce request, including librdkafka's internal retries.
    ///
    /// Must be shorter than `relay.publish_timeout_ms`, so a record whose
    /// publish already failed is never delivered afterwards.
    pub message_timeout_ms: u64,
    /// Timeout for metadata probes used to verify reachability.
    pub metadata_timeout_ms: u64,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            from_beginning: true,
            acks: "all".to_string(),
            message_timeout_ms: 2500,
            metadata_timeout_ms: 3000,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the broker backend selected by `messaging_type`.
///
/// Kafka requires the `kafka` feature.
pub fn init_broker(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Broker initialized");
            Ok(Arc::new(ChannelBroker::new()))
        }
        MessagingType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let broker = KafkaBroker::new(KafkaBrokerConfig::from(&config.kafka));
                info!(
                    messaging_type = "kafka",
                    bootstrap_servers = %config.kafka.bootstrap_servers,
                    "Broker initialized"
                );
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err("Kafka support requires the 'kafka' feature. Rebuild with --features kafka".into())
            }
        }
    }
}
