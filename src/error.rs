// error.rs
use serde_json::error::Category;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Broker unreachable after {attempts} attempts: {reason}")]
    Unreachable { attempts: u32, reason: String },
    #[error("Broker connection lost")]
    Disconnected,
    #[error("Publish failed: {0}")]
    Publish(String),
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Malformed payload: {0}")]
    Parse(String),
    #[error("Schema violation: {0}")]
    Schema(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Command {correlation_id} was not acknowledged after {attempts} attempts")]
    CommandTimeout {
        correlation_id: String,
        attempts: u32,
    },
    #[error("Device rejected command: {0}")]
    DeviceRejected(String),
    #[error("No handler for topic {0}")]
    UnknownTopic(String),
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable code sent to viewers alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Transport(_) => "transport_error",
            AppError::Parse(_) => "parse_error",
            AppError::Schema(_) => "schema_error",
            AppError::InvalidCommand(_) => "invalid_command",
            AppError::CommandTimeout { .. } => "command_timeout",
            AppError::DeviceRejected(_) => "device_rejected",
            AppError::UnknownTopic(_) => "unknown_topic",
            AppError::Internal(_) => "internal",
        }
    }
}

/// Syntax problems are parse errors; well-formed JSON of the wrong shape is a
/// schema error.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            Category::Data => AppError::Schema(err.to_string()),
            Category::Syntax | Category::Eof | Category::Io => AppError::Parse(err.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Validation failed: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}
