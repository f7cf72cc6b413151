//! blog-relay: blog mutation event relay
//!
//! Consumes blog mutation envelopes from the broker topic and pushes each one,
//! verbatim, to every connected WebSocket client.
//!
//! ## Architecture
//! ```text
//! [blog-events topic] -> [blog-relay] -> ws://host:8080/ (and /ws)
//!                             |
//!                             v
//!                      GET /health
//! ```
//!
//! ## Configuration
//! - `config.yaml` in the working directory, or the file named by BLOG_RELAY_CONFIG
//! - BLOG_RELAY__SECTION__KEY environment overrides (e.g. BLOG_RELAY__SERVER__PORT)
//! - BLOG_RELAY_LOG: tracing filter (default: info)

use tokio::net::TcpListener;
use tracing::{error, info};

use blog_relay::config::Config;
use blog_relay::relay::Relay;
use blog_relay::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(None).map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    init_tracing(config.log_format);

    info!(
        messaging_type = ?config.messaging.messaging_type,
        topic = %config.messaging.topic,
        group_id = %config.messaging.group_id,
        "Starting blog-relay"
    );

    let listener = TcpListener::bind(config.server.bind_address())
        .await
        .map_err(|e| {
            error!(address = %config.server.bind_address(), error = %e, "Failed to bind listener");
            e
        })?;

    let relay = Relay::builder(config).build()?;
    let handle = relay.start(listener).await?;

    info!(address = %handle.local_addr(), "Relay running, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;

    handle.shutdown().await;
    Ok(())
}
