//! Blog Relay - mutation event relay
//!
//! Blog mutations are published to a broker topic, consumed by one background
//! loop, and fanned out in real time to every connected WebSocket client.
//!
//! ```text
//! [CRUD layer] -> EventPublisher -> [blog-events] -> EventConsumer -> BroadcastHub -> [clients]
//! ```

pub mod bus;
pub mod config;
pub mod events;
pub mod handlers;
pub mod hub;
pub mod relay;
pub mod services;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export commonly used types
pub use bus::{Broker, BusError, ChannelBroker};
pub use config::Config;
pub use events::{EventEnvelope, EventKind, EventPublisher};
pub use hub::BroadcastHub;
pub use relay::{Relay, RelayHandle};
