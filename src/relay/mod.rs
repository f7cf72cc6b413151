//! Relay lifecycle: brings the broker, consumer and listener up in order and
//! takes them down in reverse.
//!
//! Startup never fails because of the broker. A producer that cannot connect
//! is retried in the background (publishes fail until it succeeds) and the
//! consumer keeps reconnecting on its own; clients can connect and idle
//! throughout.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::{init_broker, Broker};
use crate::config::{Config, ConfigError};
use crate::events::EventPublisher;
use crate::handlers::{router, AppState};
use crate::hub::BroadcastHub;
use crate::services::{ConsumerState, EventConsumer};
use crate::utils::retry::{consumer_backoff, MAX_RECONNECT_DELAY};
use crate::utils::shutdown;

/// How long shutdown waits for each background task.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay startup errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to initialize broker: {0}")]
    Broker(String),

    #[error("Listener error: {0}")]
    Io(#[from] io::Error),
}

/// Builder for [`Relay`].
pub struct RelayBuilder {
    config: Config,
    broker: Option<Arc<dyn Broker>>,
}

impl RelayBuilder {
    /// Use an already constructed broker instead of `messaging.type`.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn build(self) -> Result<Relay, RelayError> {
        self.config.validate()?;
        let broker = match self.broker {
            Some(broker) => broker,
            None => init_broker(&self.config.messaging)
                .map_err(|e| RelayError::Broker(e.to_string()))?,
        };
        Ok(Relay {
            config: self.config,
            broker,
        })
    }
}

/// A configured, not yet started relay.
pub struct Relay {
    config: Config,
    broker: Arc<dyn Broker>,
}

impl Relay {
    pub fn builder(config: Config) -> RelayBuilder {
        RelayBuilder {
            config,
            broker: None,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Connect the broker, start the consumer, then serve `listener`.
    pub async fn start(self, listener: TcpListener) -> Result<RelayHandle, RelayError> {
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let messaging = &self.config.messaging;
        let relay = &self.config.relay;

        // 1. Broker producer: one attempt here, retries in the background
        let producer_task = match self.broker.connect_once().await {
            Ok(()) => {
                info!("Producer connected");
                None
            }
            Err(e) => {
                error!(error = %e, "Producer connect failed, retrying in background");
                Some(tokio::spawn(reconnect_producer(
                    Arc::clone(&self.broker),
                    shutdown_rx.clone(),
                )))
            }
        };

        // 2. Consumer loop
        let hub = Arc::new(BroadcastHub::new(
            relay.delivery_timeout(),
            relay.client_buffer,
        ));
        let consumer = EventConsumer::new(
            Arc::clone(&self.broker),
            Arc::clone(&hub),
            messaging.topic.clone(),
            messaging.group_id.clone(),
        );
        let consumer_state = consumer.state();
        let consumer_task = consumer.spawn(shutdown_rx.clone());

        // 3. Listener
        let app = router(
            AppState {
                hub: Arc::clone(&hub),
                consumer_state: consumer_state.clone(),
                write_timeout: relay.write_timeout(),
            },
            &self.config.server.path,
        );
        let mut server_shutdown = shutdown_rx;
        let server_task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown::signalled(&mut server_shutdown).await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "WebSocket listener failed");
            }
        });

        info!(
            address = %local_addr,
            path = %self.config.server.path,
            topic = %messaging.topic,
            "Relay listening"
        );

        let publisher = EventPublisher::new(
            Arc::clone(&self.broker),
            messaging.topic.clone(),
            relay.publish_timeout(),
        );

        Ok(RelayHandle {
            local_addr,
            publisher,
            hub,
            consumer_state,
            broker: self.broker,
            shutdown: shutdown_tx,
            consumer_task,
            server_task,
            producer_task,
        })
    }
}

/// Running relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    publisher: EventPublisher,
    hub: Arc<BroadcastHub>,
    consumer_state: watch::Receiver<ConsumerState>,
    broker: Arc<dyn Broker>,
    shutdown: watch::Sender<bool>,
    consumer_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
    producer_task: Option<JoinHandle<()>>,
}

impl RelayHandle {
    /// Publisher bound to the relay topic, for the CRUD layer.
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    pub fn consumer_state(&self) -> watch::Receiver<ConsumerState> {
        self.consumer_state.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, stop the consumer, close every client, flush the broker.
    pub async fn shutdown(self) {
        info!("Relay shutting down");
        self.shutdown.send_replace(true);

        let closed = self.hub.close_all().await;
        info!(closed, "Closed client connections");

        join_with_timeout("consumer", self.consumer_task).await;
        join_with_timeout("listener", self.server_task).await;
        if let Some(task) = self.producer_task {
            join_with_timeout("producer reconnect", task).await;
        }

        self.broker.shutdown().await;
        info!("Relay stopped");
    }
}

async fn join_with_timeout(name: &str, task: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(task = name, error = %e, "Task panicked during shutdown"),
        Err(_) => warn!(task = name, timeout = ?SHUTDOWN_TIMEOUT, "Task did not stop in time"),
    }
}

/// Keep retrying the producer connect until it succeeds or shutdown fires.
async fn reconnect_producer(broker: Arc<dyn Broker>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = consumer_backoff().build();

    loop {
        let delay = backoff.next().unwrap_or(MAX_RECONNECT_DELAY);
        tokio::select! {
            biased;
            _ = shutdown::signalled(&mut shutdown) => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let connected = tokio::select! {
            biased;
            _ = shutdown::signalled(&mut shutdown) => return,
            result = broker.connect_once() => result,
        };
        match connected {
            Ok(()) => {
                info!("Producer connected");
                return;
            }
            Err(e) => warn!(error = %e, "Producer still unavailable"),
        }
    }
}

#[cfg(test)]
mod tests;
