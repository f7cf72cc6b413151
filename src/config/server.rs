//! Listener and relay timing configuration types.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Upgrade path that is always served.
pub const WS_PATH: &str = "/ws";
/// Health probe path.
pub const HEALTH_PATH: &str = "/health";

/// WebSocket listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port for the WebSocket listener.
    pub port: u16,
    /// Upgrade path served in addition to `/ws`.
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            path: "/".to_string(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Publish and fan-out timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upper bound for one `publish_event` call.
    pub publish_timeout_ms: u64,
    /// Deadline for queueing one broadcast payload on one connection.
    pub delivery_timeout_ms: u64,
    /// Deadline for writing one frame to a client socket.
    pub write_timeout_ms: u64,
    /// Per-connection outbound queue capacity.
    pub client_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            publish_timeout_ms: 3000,
            delivery_timeout_ms: 1000,
            write_timeout_ms: 5000,
            client_buffer: 64,
        }
    }
}

impl RelayConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("relay.publish_timeout_ms", self.publish_timeout_ms == 0),
            ("relay.delivery_timeout_ms", self.delivery_timeout_ms == 0),
            ("relay.write_timeout_ms", self.write_timeout_ms == 0),
            ("relay.client_buffer", self.client_buffer == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(ConfigError::Invalid(format!("{} must be positive", name))),
            None => Ok(()),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
