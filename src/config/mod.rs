//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod server;

pub use server::{LogFormat, RelayConfig, ServerConfig, HEALTH_PATH, WS_PATH};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "BLOG_RELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "BLOG_RELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "BLOG_RELAY_LOG";

use serde::Deserialize;

use crate::bus::{MessagingConfig, MessagingType};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket listener configuration.
    pub server: ServerConfig,
    /// Broker configuration.
    pub messaging: MessagingConfig,
    /// Publish and delivery timeouts.
    pub relay: RelayConfig,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.messaging.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("messaging.topic must not be empty".to_string()));
        }
        if self.messaging.group_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "messaging.group_id must not be empty".to_string(),
            ));
        }
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.path must start with '/': {}",
                self.server.path
            )));
        }
        if self.server.path == HEALTH_PATH {
            return Err(ConfigError::Invalid(format!(
                "server.path collides with the health endpoint: {}",
                HEALTH_PATH
            )));
        }
        if self.messaging.messaging_type == MessagingType::Kafka
            && self.messaging.kafka.message_timeout_ms >= self.relay.publish_timeout_ms
        {
            return Err(ConfigError::Invalid(format!(
                "messaging.kafka.message_timeout_ms ({}) must be below relay.publish_timeout_ms ({})",
                self.messaging.kafka.message_timeout_ms, self.relay.publish_timeout_ms
            )));
        }
        self.relay.validate()
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.relay.delivery_timeout_ms = 200;
        config.relay.publish_timeout_ms = 500;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessagingType;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_topic() {
        let mut config = Config::default();
        config.messaging.topic = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_relative_path() {
        let mut config = Config::default();
        config.server.path = "ws".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_health_path() {
        let mut config = Config::default();
        config.server.path = HEALTH_PATH.to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.server.path = WS_PATH.to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_produce_outliving_publish_deadline() {
        let mut config = Config::default();
        config.messaging.messaging_type = MessagingType::Kafka;
        assert!(config.validate().is_ok());

        config.messaging.kafka.message_timeout_ms = config.relay.publish_timeout_ms;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.relay.publish_timeout_ms += 1;
        assert!(config.validate().is_ok());

        // The in-process broker has no queued retries
        config.messaging.messaging_type = MessagingType::Channel;
        config.messaging.kafka.message_timeout_ms = 60_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.relay.delivery_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.client_buffer = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
server:
  port: 9090
messaging:
  type: kafka
  topic: custom-events
  kafka:
    bootstrap_servers: "broker-1:9092"
    from_beginning: false
relay:
  delivery_timeout_ms: 250
log_format: json
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.messaging.messaging_type, MessagingType::Kafka);
        assert_eq!(config.messaging.topic, "custom-events");
        assert_eq!(config.messaging.group_id, "blogGroup");
        assert_eq!(config.messaging.kafka.bootstrap_servers, "broker-1:9092");
        assert!(!config.messaging.kafka.from_beginning);
        assert_eq!(config.relay.delivery_timeout_ms, 250);
        assert_eq!(config.relay.publish_timeout_ms, 3000);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    #[serial]
    fn test_env_overrides_defaults() {
        std::env::set_var("BLOG_RELAY__SERVER__PORT", "7070");
        std::env::set_var("BLOG_RELAY__MESSAGING__GROUP_ID", "relay-b");

        let result = Config::load(None);

        std::env::remove_var("BLOG_RELAY__SERVER__PORT");
        std::env::remove_var("BLOG_RELAY__MESSAGING__GROUP_ID");

        let config = result.unwrap();
        assert_eq!(config.server.port, 7070);
        assert_eq!(config.messaging.group_id, "relay-b");
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        let result = Config::load(Some("/nonexistent/blog-relay.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
