//! Error types for rolekeeper.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Chat platform (Discord) errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{method} {path} returned {status}: {body}")]
    Api {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Gateway error: {0}")]
    Gateway(String),
}

/// Spreadsheet errors.
#[derive(Debug, thiserror::Error)]
pub enum SheetError {
    #[error("Request for {range} failed: {reason}")]
    RequestFailed { range: String, reason: String },

    #[error("Writes need service-account credentials")]
    ReadOnly,

    #[error("Invalid column index {0} (columns are 1-based)")]
    InvalidColumn(usize),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
}

/// Calendar errors.
#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("Calendar {calendar_id} request failed: {reason}")]
    RequestFailed { calendar_id: String, reason: String },

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
}

/// Google OAuth errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid service account key: {0}")]
    InvalidKey(String),

    #[error("Signing failed")]
    Signing,

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),
}

/// Sweep and migration errors.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("A sweep is already running")]
    AlreadyRunning,

    #[error("Role {0} does not exist on the server")]
    MissingRole(String),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}
