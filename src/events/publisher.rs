//! Event publisher used by the CRUD layer after a committed mutation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{EventEnvelope, EventKind};
use crate::bus::{Broker, BusError, Result};

/// Publishes envelopes to the relay topic.
///
/// Every call is bounded by `timeout` so broker latency never holds up the
/// request that triggered it. Failures come back as `BusError::Publish`; the
/// mutation that caused the event has already been stored and stays valid.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    topic: String,
    timeout: Duration,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            broker,
            topic: topic.into(),
            timeout,
        }
    }

    /// Build an envelope for `kind` and publish it.
    pub async fn publish_event(&self, kind: EventKind, payload: Value) -> Result<EventEnvelope> {
        let envelope = EventEnvelope::new(kind, payload);
        self.publish_envelope(&envelope).await?;
        Ok(envelope)
    }

    /// Publish a prepared envelope.
    #[tracing::instrument(name = "relay.publish", skip_all, fields(kind = %envelope.kind, topic = %self.topic))]
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> Result<()> {
        let body = envelope.to_json()?;
        let key = envelope.entity_id();

        let sent = tokio::time::timeout(
            self.timeout,
            self.broker.publish(&self.topic, key.as_deref(), body.as_bytes()),
        )
        .await;

        match sent {
            Ok(Ok(())) => {
                info!(envelope = %body, "Message sent to topic");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Error sending message");
                Err(match e {
                    BusError::Publish(_) => e,
                    other => BusError::Publish(other.to_string()),
                })
            }
            Err(_) => {
                error!(timeout = ?self.timeout, "Publish timed out");
                Err(BusError::Publish(format!(
                    "no broker acknowledgment within {:?}",
                    self.timeout
                )))
            }
        }
    }

    /// Publish on a background task; failures are logged and swallowed.
    pub fn publish_detached(&self, kind: EventKind, payload: Value) -> JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.publish_event(kind, payload).await {
                warn!(kind = %kind, error = %e, "Event not relayed; mutation remains committed");
            }
        })
    }
}
