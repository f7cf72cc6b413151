//! Event consumer loop: broker topic → broadcast hub.
//!
//! One long-lived task pulls records from the relay topic and broadcasts
//! each one. Waiting for the next record is the only suspension point
//! besides the hub's bounded deliveries. A lost broker session sends the
//! loop back to `Connecting`, where it resubscribes with exponential
//! backoff; records the broker did not deliver meanwhile are not replayed.

use std::fmt;
use std::sync::Arc;

use backon::BackoffBuilder;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{Broker, BusError, Record, Subscription};
use crate::events::decode_payload;
use crate::hub::{BroadcastHub, BroadcastReport};
use crate::utils::retry::{consumer_backoff, MAX_RECONNECT_DELAY};
use crate::utils::shutdown;

/// Consumer loop lifecycle.
///
/// `Stopped → Connecting → Running → (Stopping → Stopped)`; a transport
/// failure moves `Running` back to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Stopped,
    Connecting,
    Running,
    Stopping,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Stopped => "stopped",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Running => "running",
            ConsumerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Why the pull loop over one subscription ended.
enum PumpExit {
    Shutdown,
    /// The session was lost after handing out `received` records.
    Disconnected { received: u64 },
}

/// Pulls envelopes from the relay topic and fans them out through the hub.
pub struct EventConsumer {
    broker: Arc<dyn Broker>,
    hub: Arc<BroadcastHub>,
    topic: String,
    group_id: String,
    state: watch::Sender<ConsumerState>,
}

impl EventConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        hub: Arc<BroadcastHub>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Stopped);
        Self {
            broker,
            hub,
            topic: topic.into(),
            group_id: group_id.into(),
            state,
        }
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Run the loop on a background task until `shutdown` fires.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Consume until shutdown, reconnecting with backoff on broker failures.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let backoff_builder = consumer_backoff();
        let mut backoff = backoff_builder.build();

        loop {
            self.set_state(ConsumerState::Connecting);

            let subscribed = tokio::select! {
                biased;
                _ = shutdown::signalled(&mut shutdown) => break,
                result = self.broker.subscribe(&self.topic, &self.group_id) => result,
            };

            match subscribed {
                Ok(mut subscription) => {
                    info!(
                        topic = %self.topic,
                        group_id = %self.group_id,
                        "Consumer connected, processing messages"
                    );
                    self.set_state(ConsumerState::Running);

                    match self.pump(subscription.as_mut(), &mut shutdown).await {
                        PumpExit::Shutdown => {
                            self.set_state(ConsumerState::Stopping);
                            subscription.close();
                            break;
                        }
                        // A subscribe that never yields a record does not count as recovery
                        PumpExit::Disconnected { received } if received > 0 => {
                            backoff = backoff_builder.build();
                        }
                        PumpExit::Disconnected { .. } => {}
                    }
                    self.set_state(ConsumerState::Connecting);
                }
                Err(e) => {
                    error!(
                        topic = %self.topic,
                        group_id = %self.group_id,
                        error = %e,
                        "Failed to subscribe, retrying after backoff"
                    );
                }
            }

            let delay = backoff.next().unwrap_or(MAX_RECONNECT_DELAY);
            debug!(backoff_ms = %delay.as_millis(), "Waiting before reconnect");
            tokio::select! {
                biased;
                _ = shutdown::signalled(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConsumerState::Stopping);
        self.set_state(ConsumerState::Stopped);
        info!(topic = %self.topic, "Consumer stopped");
    }

    /// Pull and broadcast until shutdown or the session is lost.
    async fn pump(
        &self,
        subscription: &mut dyn Subscription,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        let mut received = 0u64;
        let mut skipped = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown::signalled(shutdown) => return PumpExit::Shutdown,
                next = subscription.next() => next,
            };

            match next {
                Some(Ok(record)) => {
                    received += 1;
                    if self.handle_record(&record).await.is_err() {
                        skipped += 1;
                    }
                }
                Some(Err(e)) => {
                    error!(
                        topic = %self.topic,
                        received,
                        skipped,
                        error = %e,
                        "Consumer read failed, will reconnect"
                    );
                    return PumpExit::Disconnected { received };
                }
                None => {
                    warn!(topic = %self.topic, received, skipped, "Subscription ended, will reconnect");
                    return PumpExit::Disconnected { received };
                }
            }
        }
    }

    /// Decode one record and broadcast it.
    ///
    /// A record that does not decode is skipped with `BusError::Decode`.
    pub async fn handle_record(&self, record: &Record) -> Result<BroadcastReport, BusError> {
        let payload = match decode_payload(record.payload.as_deref()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Skipping malformed message"
                );
                return Err(e);
            }
        };

        info!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Received message"
        );
        debug!(envelope = %payload, "Broadcasting message");

        Ok(self.hub.broadcast(payload).await)
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Consumer state changed");
        }
    }
}
