use thiserror::Error;

/// Errors raised while talking to the OANDA API.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("API request failed with status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("response parse error: {0}")]
    ParseError(String),
    #[error("invalid info target: {0}")]
    InvalidTarget(String),
    #[error("{0}: instruments required")]
    InstrumentsRequired(String),
}

/// Errors raised by the CSV / SQLite / queue sinks.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("data not found: {0}")]
    NotFound(String),
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("database error: {0}")]
    DatabaseError(String),
}

/// Errors raised while loading or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
}
