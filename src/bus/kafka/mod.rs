//! Kafka broker implementation.
//!
//! A single producer session publishes to the relay topic; each subscription
//! owns its own `StreamConsumer` joined to the configured consumer group.
//! Offsets are committed asynchronously as soon as a record is pulled, so a
//! restarted consumer resumes after the last record handed out (at-most-once).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{Broker, BusError, KafkaConfig, Record, Result, Subscription};
use crate::utils::retry::connection_backoff;

/// Configuration for the Kafka connection.
#[derive(Clone, Debug)]
pub struct KafkaBrokerConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Client identifier.
    pub client_id: String,
    /// Start fresh groups at the earliest offset.
    pub from_beginning: bool,
    /// Producer acknowledgment level.
    pub acks: String,
    /// Produce timeout in milliseconds.
    pub message_timeout_ms: u64,
    /// Metadata probe timeout in milliseconds.
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

impl KafkaBrokerConfig {
    /// Create config with defaults for the given bootstrap servers.
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Self::from(&KafkaConfig::default())
        }
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    /// Set the client identifier.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    fn offset_reset(&self) -> &'static str {
        if self.from_beginning {
            "earliest"
        } else {
            "latest"
        }
    }

    /// Build a ClientConfig for producers.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("message.timeout.ms", self.message_timeout_ms.to_string());
        config.set("acks", &self.acks);

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for consumers.
    fn build_consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("group.id", group_id);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", self.offset_reset());

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

impl From<&KafkaConfig> for KafkaBrokerConfig {
    fn from(config: &KafkaConfig) -> Self {
        Self {
            bootstrap_servers: config.bootstrap_servers.clone(),
            client_id: config.client_id.clone(),
            from_beginning: config.from_beginning,
            acks: config.acks.clone(),
            message_timeout_ms: config.message_timeout_ms,
            metadata_timeout_ms: config.metadata_timeout_ms,
            sasl_username: config.sasl_username.clone(),
            sasl_password: config.sasl_password.clone(),
            sasl_mechanism: config.sasl_mechanism.clone(),
            security_protocol: config.security_protocol.clone(),
            ssl_ca_location: config.ssl_ca_location.clone(),
        }
    }
}

/// Kafka broker session.
///
/// The producer is created lazily by `connect`, which verifies the cluster is
/// reachable with a metadata request and retries with `connection_backoff`.
pub struct KafkaBroker {
    config: KafkaBrokerConfig,
    producer: RwLock<Option<FutureProducer>>,
    connect_lock: Mutex<()>,
    connected: AtomicBool,
}

impl KafkaBroker {
    /// Create a new, not yet connected, Kafka broker.
    pub fn new(config: KafkaBrokerConfig) -> Self {
        Self {
            config,
            producer: RwLock::new(None),
            connect_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
        }
    }

    /// Create a producer and prove the cluster answers metadata requests.
    async fn open_producer(&self) -> Result<FutureProducer> {
        let producer: FutureProducer = self
            .config
            .build_producer_config()
            .create()
            .map_err(|e| BusError::Unavailable(format!("Failed to create Kafka producer: {}", e)))?;

        let probe = producer.clone();
        let timeout = self.config.metadata_timeout();
        tokio::task::spawn_blocking(move || probe.client().fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(|e| BusError::Unavailable(format!("Metadata probe aborted: {}", e)))?
            .map_err(|e| BusError::Unavailable(format!("Kafka metadata request failed: {}", e)))?;

        Ok(producer)
    }

    async fn install(&self, producer: FutureProducer) {
        *self.producer.write().await = Some(producer);
        self.connected.store(true, Ordering::SeqCst);

        info!(
            bootstrap_servers = %self.config.bootstrap_servers,
            client_id = %self.config.client_id,
            "Kafka producer connected"
        );
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let producer = (|| self.open_producer())
            .retry(connection_backoff())
            .notify(|err: &BusError, dur: Duration| {
                warn!(
                    bootstrap_servers = %self.config.bootstrap_servers,
                    error = %err,
                    delay = ?dur,
                    "Kafka connection failed, retrying"
                );
            })
            .await?;

        self.install(producer).await;
        Ok(())
    }

    async fn connect_once(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let producer = self.open_producer().await?;
        self.install(producer).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<()> {
        let producer = self
            .producer
            .read()
            .await
            .clone()
            .ok_or_else(|| BusError::Publish("Kafka producer is not connected".to_string()))?;

        let mut record = FutureRecord::to(topic).payload(payload);

        if let Some(k) = key {
            record = record.key(k);
        }

        let (partition, offset) = producer
            .send(record, self.config.message_timeout())
            .await
            .map_err(|(e, _)| BusError::Publish(format!("Failed to publish: {}", e)))?;

        debug!(
            topic = %topic,
            key = ?key,
            partition,
            offset,
            "Published record to Kafka"
        );

        Ok(())
    }

    async fn subscribe(&self, topic: &str, group_id: &str) -> Result<Box<dyn Subscription>> {
        let consumer: StreamConsumer = self
            .config
            .build_consumer_config(group_id)
            .create()
            .map_err(|e| BusError::Subscribe(format!("Failed to create Kafka consumer: {}", e)))?;
        let consumer = Arc::new(consumer);

        consumer
            .subscribe(&[topic])
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to topic: {}", e)))?;

        // subscribe() only records interest; probe the topic so an unreachable
        // cluster is reported here rather than as a silent stall.
        let probe = Arc::clone(&consumer);
        let probe_topic = topic.to_string();
        let timeout = self.config.metadata_timeout();
        tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(Some(&probe_topic), timeout)
                .map(|_| ())
        })
        .await
        .map_err(|e| BusError::Subscribe(format!("Metadata probe aborted: {}", e)))?
        .map_err(|e| BusError::Subscribe(format!("Kafka metadata request failed: {}", e)))?;

        info!(
            topic = %topic,
            group_id = %group_id,
            offset_reset = self.config.offset_reset(),
            "Subscribed to Kafka topic"
        );

        Ok(Box::new(KafkaSubscription {
            consumer,
            topic: topic.to_string(),
        }))
    }

    async fn shutdown(&self) {
        let producer = self.producer.write().await.take();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(producer) = producer {
            let timeout = self.config.message_timeout();
            match tokio::task::spawn_blocking(move || producer.flush(timeout)).await {
                Ok(Ok(())) => info!("Kafka producer flushed"),
                Ok(Err(e)) => error!(error = %e, "Failed to flush Kafka producer"),
                Err(e) => error!(error = %e, "Kafka flush task aborted"),
            }
        }
    }
}

/// Consumer-group subscription to one topic.
pub struct KafkaSubscription {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self) -> Option<Result<Record>> {
        match self.consumer.recv().await {
            Ok(message) => {
                let record = Record {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    payload: message.payload().map(|p| p.to_vec()),
                };

                // Commit on receipt: the record is handed out at most once
                if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                    error!(error = %e, offset = record.offset, "Failed to commit offset");
                }

                Some(Ok(record))
            }
            Err(e) => Some(Err(BusError::Transport(format!(
                "Kafka consumer error: {}",
                e
            )))),
        }
    }

    fn close(&mut self) {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "Unsubscribed from Kafka topic");
    }
}
