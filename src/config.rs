use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::subjects;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub nats: NatsSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub reference: ReferenceSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NatsSettings {
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_durable")]
    pub durable: String,
    /// Redelivery timer: a message left un-acked comes back after this.
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
    /// Empty disables dead-letter publishing.
    #[serde(default)]
    pub dlq_subject: Option<String>,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            stream: default_stream(),
            subject: default_subject(),
            durable: default_durable(),
            ack_wait_secs: default_ack_wait_secs(),
            max_deliver: default_max_deliver(),
            dlq_subject: Some(subjects::SIGNAL_DLQ.to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ReferenceSettings {
    /// JSON seed applied at boot when set (exchanges, pairs, balances, ...).
    #[serde(default)]
    pub seed_path: Option<String>,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_stream() -> String {
    subjects::SIGNAL_STREAM.to_string()
}

fn default_subject() -> String {
    subjects::SIGNAL_INTAKE.to_string()
}

fn default_durable() -> String {
    subjects::SIGNAL_DURABLE.to_string()
}

fn default_ack_wait_secs() -> u64 {
    30
}

fn default_max_deliver() -> i64 {
    5
}

fn default_store_path() -> String {
    "arbiter-signal.redb".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            // 1. Global config from ~/.arbiter/config.json
            .add_source(File::with_name(&format!("{}/.arbiter/config", home)).required(false))
            // 2. Project config from config/config.{json,toml}
            .add_source(File::with_name("config/config").required(false))
            // 3. Local overrides, not checked in
            .add_source(File::with_name("config/local").required(false))
            // 4. Environment overrides, e.g. ARBITER__NATS__URL
            .add_source(Environment::with_prefix("ARBITER").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let settings = Settings::default();
        assert_eq!(settings.nats.url, "nats://localhost:4222");
        assert_eq!(settings.nats.stream, subjects::SIGNAL_STREAM);
        assert_eq!(settings.nats.ack_wait_secs, 30);
        assert_eq!(settings.nats.max_deliver, 5);
        assert!(!settings.store.path.is_empty());
        assert!(settings.reference.seed_path.is_none());
    }

    #[test]
    fn partial_json_fills_missing_fields() {
        let raw = serde_json::json!({
            "nats": { "url": "nats://broker:4222" }
        });
        let settings: Settings = serde_json::from_value(raw).unwrap();
        assert_eq!(settings.nats.url, "nats://broker:4222");
        assert_eq!(settings.nats.durable, subjects::SIGNAL_DURABLE);
    }
}
