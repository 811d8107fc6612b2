// config/mod.rs
use crate::{colors::ColorTable, error::ConfigError, models::Color};
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    #[validate(nested)]
    pub server: ServerSettings,
    #[validate(nested)]
    pub broker: BrokerSettings,
    pub topics: TopicSettings,
    #[validate(nested)]
    pub commands: CommandSettings,
    #[validate(nested)]
    pub state: StateSettings,
    pub colors: ColorSettings,
    #[validate(nested)]
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ServerSettings {
    #[validate(length(min = 1))]
    pub address: String,
    pub cors_origin: String,
    #[validate(range(min = 1))]
    pub viewer_buffer: usize,
    pub replay_window: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:3001".to_string(),
            cors_origin: "http://localhost:5173".to_string(),
            viewer_buffer: 256,
            replay_window: 512,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct BrokerSettings {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[validate(length(min = 1))]
    pub client_id: String,
    #[validate(range(min = 1))]
    pub keep_alive_secs: u64,
    #[validate(range(min = 1))]
    pub connect_attempts: u32,
    #[validate(range(min = 1))]
    pub backoff_initial_ms: u64,
    #[validate(range(min = 1))]
    pub backoff_max_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "dobot-relay".to_string(),
            keep_alive_secs: 30,
            connect_attempts: 5,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl BrokerSettings {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Routing of inbound device messages by topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    State,
    History,
    Queue,
    Ack,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicSettings {
    pub status: String,
    pub telemetry: String,
    pub history: String,
    pub queue: String,
    pub ack: String,
    pub command: String,
    /// Publishing here asks the device for a full state dump.
    pub state_request: Option<String>,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            status: "device/status".to_string(),
            telemetry: "device/telemetry".to_string(),
            history: "device/history".to_string(),
            queue: "device/queue".to_string(),
            ack: "device/ack".to_string(),
            command: "device/command".to_string(),
            state_request: Some("device/state_request".to_string()),
        }
    }
}

impl TopicSettings {
    pub fn kind_of(&self, topic: &str) -> Option<TopicKind> {
        if topic == self.status || topic == self.telemetry {
            Some(TopicKind::State)
        } else if topic == self.history {
            Some(TopicKind::History)
        } else if topic == self.queue {
            Some(TopicKind::Queue)
        } else if topic == self.ack {
            Some(TopicKind::Ack)
        } else {
            None
        }
    }

    /// Topics the relay subscribes to, without duplicates.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for topic in [
            &self.status,
            &self.telemetry,
            &self.history,
            &self.queue,
            &self.ack,
        ] {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        topics
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct CommandSettings {
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
    #[validate(range(max = 20))]
    pub max_retries: u32,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_retries: 2,
        }
    }
}

impl CommandSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct StateSettings {
    #[validate(range(min = 1))]
    pub max_history: usize,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self { max_history: 50 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColorSettings {
    pub aliases: HashMap<String, Color>,
}

impl Default for ColorSettings {
    fn default() -> Self {
        Self {
            aliases: crate::colors::default_aliases(),
        }
    }
}

impl ColorSettings {
    pub fn table(&self) -> ColorTable {
        ColorTable::new(self.aliases.iter().map(|(label, color)| (label, *color)))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9000,
        }
    }
}

impl Settings {
    /// Defaults, then `config/config.*` if present, then `APP_*` environment
    /// variables (`APP_BROKER__HOST=mqtt.local`).
    pub fn new() -> Result<Self, ConfigError> {
        Self::load("config/config")
    }

    pub fn load(file: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.commands.timeout(), Duration::from_secs(5));
        assert_eq!(settings.state.max_history, 50);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = Settings::load("config/does-not-exist").expect("defaults load");
        assert_eq!(settings.topics.command, "device/command");
        assert_eq!(settings.broker.port, 1883);
    }

    #[test]
    fn zero_timeout_and_history_are_rejected() {
        let mut settings = Settings::default();
        settings.commands.timeout_ms = 0;
        settings.state.max_history = 0;
        let errors = settings.validate().expect_err("invalid settings");
        let fields = errors.errors();
        assert!(fields.contains_key("commands"));
        assert!(fields.contains_key("state"));
    }

    #[test]
    fn topics_route_by_kind_and_deduplicate_subscriptions() {
        let mut topics = TopicSettings::default();
        topics.telemetry = topics.status.clone();
        assert_eq!(topics.kind_of("device/status"), Some(TopicKind::State));
        assert_eq!(topics.kind_of("device/history"), Some(TopicKind::History));
        assert_eq!(topics.kind_of("device/ack"), Some(TopicKind::Ack));
        assert_eq!(topics.kind_of("device/other"), None);
        assert_eq!(topics.subscriptions().len(), 4);
    }
}
