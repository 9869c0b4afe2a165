use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the relying-party session machinery.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("provider returned HTTP {status}")]
    ServerUnavailable { status: StatusCode },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("provider error '{error}'{}", describe(.description))]
    Provider {
        error: String,
        description: Option<String>,
    },
    #[error("ID token validation failed: {0}")]
    Validation(String),
    #[error("authorization state mismatch")]
    StateMismatch,
    #[error("no pending authorization request")]
    NoPendingRequest,
    #[error("refresh token rejected by provider; interactive login required")]
    InvalidGrant,
    #[error("another session operation is already in progress")]
    OperationInProgress,
    #[error("silent renewal timed out")]
    RenewalTimeout,
    #[error("no renewal mechanism available for the current session")]
    RenewalUnavailable,
    #[error("operation cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("authorization listener terminated before receiving redirect")]
    ListenerClosed,
    #[error("failed to launch system browser: {0}")]
    BrowserLaunch(String),
    #[error("authorization response missing code parameter")]
    MissingAuthorizationCode,
    #[error("invalid authorization response: {0}")]
    InvalidAuthorizationResponse(String),
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|text| format!(": {text}"))
        .unwrap_or_default()
}

impl AuthError {
    /// Errors worth retrying for idempotent back-channel requests.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Network(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            AuthError::ServerUnavailable { .. } => true,
            _ => false,
        }
    }

    /// Errors after which the current session can no longer be renewed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::InvalidGrant | AuthError::Validation(_))
    }
}
