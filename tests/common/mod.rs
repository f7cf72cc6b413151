//! Shared utilities for relay integration tests.
//!
//! Starts a full relay on an ephemeral port backed by the in-process channel
//! broker and drives it with real WebSocket clients.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use blog_relay::bus::ChannelBroker;
use blog_relay::config::Config;
use blog_relay::relay::{Relay, RelayHandle};
use blog_relay::services::ConsumerState;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for any single wait.
pub const WAIT: Duration = Duration::from_secs(5);
/// How long a client must stay quiet to count as "received nothing".
pub const QUIET: Duration = Duration::from_millis(300);

/// Start a relay on 127.0.0.1 with an ephemeral port.
pub async fn start_relay(config: Config, broker: Arc<ChannelBroker>) -> RelayHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    Relay::builder(config)
        .broker(broker)
        .build()
        .expect("relay should build")
        .start(listener)
        .await
        .expect("relay should start")
}

/// Start a relay and wait for its consumer to be subscribed.
pub async fn start_running_relay() -> (RelayHandle, Arc<ChannelBroker>) {
    let broker = Arc::new(ChannelBroker::new());
    let relay = start_relay(Config::for_test(), broker.clone()).await;
    wait_for_consumer(&relay, ConsumerState::Running).await;
    (relay, broker)
}

pub async fn wait_for_consumer(relay: &RelayHandle, target: ConsumerState) {
    let mut state = relay.consumer_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == target))
        .await
        .expect("consumer state not reached in time")
        .expect("consumer dropped");
}

/// Open a WebSocket to `path` and wait until the hub has registered it.
pub async fn connect(relay: &RelayHandle, path: &str) -> Client {
    let before = relay.hub().len().await;
    let url = format!("ws://{}{}", relay.local_addr(), path);
    let (client, _) = connect_async(url).await.expect("WebSocket handshake");
    wait_for_connections(relay, before + 1).await;
    client
}

/// Wait until the hub holds exactly `expected` connections.
pub async fn wait_for_connections(relay: &RelayHandle, expected: usize) {
    let hub = relay.hub();
    tokio::time::timeout(WAIT, async {
        while hub.len().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("hub never reached {} connections", expected));
}

/// Next text frame, skipping control frames.
pub async fn next_text(client: &mut Client) -> String {
    loop {
        let frame = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("no frame in time")
            .expect("stream ended")
            .expect("WebSocket error");
        match frame {
            Message::Text(text) => return text.as_str().to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Assert no data frame arrives within `QUIET`.
pub async fn expect_silence(client: &mut Client) {
    let deadline = tokio::time::Instant::now() + QUIET;
    loop {
        match tokio::time::timeout_at(deadline, client.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got {:?}", other),
        }
    }
}

/// Assert the server closes the connection.
pub async fn expect_closed(client: &mut Client) {
    loop {
        let frame = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("connection not closed in time");
        match frame {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("expected close, got {:?}", other),
        }
    }
}
