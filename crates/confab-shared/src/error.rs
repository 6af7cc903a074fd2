use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced synchronously at SDK call sites.
///
/// Transport-level failures never travel through this type; they are
/// delivered as [`TransportFailure`] values inside events and callbacks.
#[derive(Error, Debug)]
pub enum ConfabError {
    /// Malformed entity id passed by the caller.
    #[error("Invalid entity id: {0}")]
    Id(#[from] IdError),

    /// A required field was missing from a call.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The targeted entity has been destroyed or was never cached.
    #[error("Unknown or destroyed entity: {0}")]
    UnknownEntity(String),

    /// The client has been destroyed; no further calls are valid.
    #[error("Client has been destroyed")]
    ClientDestroyed,

    /// The operation requires an authenticated session.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Bad query predicate string.
    #[error("Invalid query predicate: {0}")]
    Predicate(String),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Entity id validation errors.
#[derive(Error, Debug)]
pub enum IdError {
    #[error("Id does not use the confab:/// scheme: {0}")]
    BadScheme(String),

    #[error("Unknown entity kind: {0}")]
    UnknownKind(String),

    #[error("Malformed entity id: {0}")]
    Malformed(String),
}

/// Structured failure delivered to the embedding application through
/// events and operation callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportFailure {
    /// Stable machine-readable code, e.g. `offline`, `timeout`,
    /// `server_rejected`, `cancelled`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// URL of the failing request, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// HTTP status of the failing response, when one was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl TransportFailure {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            url: None,
            http_status: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(status) = self.http_status {
            write!(f, " (HTTP {status})")?;
        }
        Ok(())
    }
}

/// Convenience alias used throughout the SDK.
pub type Result<T> = std::result::Result<T, ConfabError>;
