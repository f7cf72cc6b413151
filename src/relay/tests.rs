use super::*;
use crate::bus::{BusError, ChannelBroker, Subscription};
use crate::events::EventKind;
use crate::test_utils::{recv_text, wait_for_state, TEST_TIMEOUT};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

async fn start_relay(broker: Arc<ChannelBroker>) -> RelayHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    Relay::builder(Config::for_test())
        .broker(broker)
        .build()
        .unwrap()
        .start(listener)
        .await
        .unwrap()
}

#[test]
fn test_build_rejects_invalid_config() {
    let mut config = Config::for_test();
    config.messaging.topic = String::new();

    let result = Relay::builder(config).build();
    assert!(matches!(result, Err(RelayError::Config(_))));
}

#[test]
fn test_build_uses_configured_broker() {
    let relay = Relay::builder(Config::for_test()).build().unwrap();
    assert!(!relay.broker().is_connected());
}

#[tokio::test]
async fn test_start_connects_and_runs_consumer() {
    let broker = Arc::new(ChannelBroker::new());
    let relay = start_relay(broker.clone()).await;

    assert!(broker.is_connected());
    assert_ne!(relay.local_addr().port(), 0);
    wait_for_state(&mut relay.consumer_state(), ConsumerState::Running).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_publish_reaches_hub_connections() {
    let broker = Arc::new(ChannelBroker::new());
    let relay = start_relay(broker).await;
    wait_for_state(&mut relay.consumer_state(), ConsumerState::Running).await;

    let mut client = relay.hub().open().await.unwrap();
    let envelope = relay
        .publisher()
        .publish_event(EventKind::Created, json!({"id": "42", "blogName": "Hello"}))
        .await
        .unwrap();

    assert_eq!(recv_text(&mut client).await, envelope.to_json().unwrap());

    relay.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_broker_does_not_stop_listener() {
    let broker = Arc::new(ChannelBroker::new());
    broker.set_available(false);
    let relay = start_relay(broker.clone()).await;

    // Clients still connect and idle
    let mut client = relay.hub().open().await.unwrap();

    let result = relay
        .publisher()
        .publish_event(EventKind::Liked, json!({"id": "42", "like": 1}))
        .await;
    assert!(matches!(result, Err(BusError::Publish(_))));
    assert!(client.try_recv().is_none());

    // Background reconnect picks the broker up once it is back
    broker.set_available(true);
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !broker.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("producer should reconnect");
    wait_for_state(&mut relay.consumer_state(), ConsumerState::Running).await;

    relay
        .publisher()
        .publish_event(EventKind::Liked, json!({"id": "42", "like": 2}))
        .await
        .unwrap();
    assert!(recv_text(&mut client).await.contains(r#""like":2"#));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients_and_stops_consumer() {
    let broker = Arc::new(ChannelBroker::new());
    let relay = start_relay(broker.clone()).await;
    let mut state = relay.consumer_state();
    wait_for_state(&mut state, ConsumerState::Running).await;

    let hub = relay.hub();
    let mut client = hub.open().await.unwrap();

    relay.shutdown().await;

    assert_eq!(*state.borrow(), ConsumerState::Stopped);
    assert!(hub.is_empty().await);
    assert!(hub.open().await.is_none());
    assert_eq!(client.recv().await, None);
    assert_eq!(broker.subscriber_count("blog-events").await, 0);
}

/// A broker whose retrying connect never finishes and whose single attempts fail.
#[derive(Default)]
struct StalledBroker {
    attempts: AtomicUsize,
}

#[async_trait]
impl Broker for StalledBroker {
    async fn connect(&self) -> crate::bus::Result<()> {
        std::future::pending().await
    }

    async fn connect_once(&self) -> crate::bus::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(BusError::Unavailable("connection refused".to_string()))
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn publish(
        &self,
        _topic: &str,
        _key: Option<&str>,
        _payload: &[u8],
    ) -> crate::bus::Result<()> {
        Err(BusError::Publish("not connected".to_string()))
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _group_id: &str,
    ) -> crate::bus::Result<Box<dyn Subscription>> {
        Err(BusError::Subscribe("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_start_does_not_wait_for_broker_retries() {
    let broker = Arc::new(StalledBroker::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = Relay::builder(Config::for_test())
        .broker(broker.clone())
        .build()
        .unwrap();

    let relay = tokio::time::timeout(Duration::from_secs(1), relay.start(listener))
        .await
        .expect("start should not run the full connect retry policy")
        .unwrap();
    assert!(broker.attempts.load(Ordering::SeqCst) >= 1);

    // The background reconnect keeps making single attempts
    tokio::time::timeout(TEST_TIMEOUT, async {
        while broker.attempts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("producer reconnect should retry");

    let mut client = relay.hub().open().await.unwrap();
    relay.shutdown().await;
    assert_eq!(client.recv().await, None);
}
