//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast if required values are missing.
//! Broker credentials are wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::address::{BrokerAddress, redact_url};
use crate::error::{Error, Result};
use crate::model::Destination;

#[derive(Debug, Deserialize)]
pub struct OutboxConfig {
    /// Exchange every message is published to.
    pub exchange: String,
    pub routing_key: String,
    /// JSON file holding undelivered messages.
    pub store_path: PathBuf,
    /// Full broker URL. Takes precedence over `broker`.
    #[serde(default)]
    pub amqp_url: Option<SecretString>,
    #[serde(default)]
    pub broker: BrokerAddress,
    #[serde(default)]
    pub otel_endpoint: Option<String>,
    /// Name reported on exported traces, metrics and logs.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds between background drains when a redelivery loop runs.
    #[serde(default = "default_redelivery_secs")]
    pub redelivery_secs: u64,
}

impl OutboxConfig {
    /// Minimal configuration: everything else takes its default.
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        store_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            store_path: store_path.into(),
            amqp_url: None,
            broker: BrokerAddress::default(),
            otel_endpoint: None,
            service_name: default_service_name(),
            log_level: default_log_level(),
            redelivery_secs: default_redelivery_secs(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = BrokerAddress::default();
        let broker = BrokerAddress {
            user: std::env::var("OUTBOX_AMQP_USER").unwrap_or(defaults.user),
            password: std::env::var("OUTBOX_AMQP_PASSWORD")
                .map(SecretString::from)
                .unwrap_or(defaults.password),
            host: std::env::var("OUTBOX_AMQP_HOST").unwrap_or(defaults.host),
            port: parsed_var("OUTBOX_AMQP_PORT")?.unwrap_or(defaults.port),
            connection_attempts: parsed_var("OUTBOX_AMQP_CONNECTION_ATTEMPTS")?
                .unwrap_or(defaults.connection_attempts),
            heartbeat_interval: parsed_var("OUTBOX_AMQP_HEARTBEAT_INTERVAL")?
                .unwrap_or(defaults.heartbeat_interval),
        };

        Ok(Self {
            exchange: required_var("OUTBOX_EXCHANGE")?,
            routing_key: required_var("OUTBOX_ROUTING_KEY")?,
            store_path: PathBuf::from(required_var("OUTBOX_STORE_PATH")?),
            amqp_url: std::env::var("OUTBOX_AMQP_URL").ok().map(SecretString::from),
            broker,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| default_service_name()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
            redelivery_secs: parsed_var("OUTBOX_REDELIVERY_SECS")?
                .unwrap_or_else(default_redelivery_secs),
        })
    }

    /// Load configuration from a TOML document.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn destination(&self) -> Destination {
        Destination::new(&self.exchange, &self.routing_key)
    }

    /// The explicit URL if one was given, otherwise one built from `broker`.
    pub fn resolved_address(&self) -> SecretString {
        match &self.amqp_url {
            Some(url) => SecretString::from(secrets::expose(url).to_string()),
            None => self.broker.to_url(),
        }
    }

    /// The resolved address with its password masked.
    pub fn redacted_address(&self) -> String {
        match &self.amqp_url {
            Some(url) => redact_url(secrets::expose(url)),
            None => self.broker.redacted(),
        }
    }

    pub fn redelivery_interval(&self) -> Duration {
        Duration::from_secs(self.redelivery_secs.max(1))
    }
}

fn default_service_name() -> String {
    "outbox-sender".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_redelivery_secs() -> u64 {
    30
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
