// Error taxonomy for the conversation client

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the conversation client and its ports
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChatError {
    /// Network hiccup; retried with backoff
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// A bounded operation did not finish in time; retried like a disconnect
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Bad input, rejected before anything is queued
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Not signed in")]
    NotSignedIn,

    /// Malformed inbound realtime payload
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Whether the operation may succeed if attempted again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::TransientNetwork(_) | ChatError::Timeout(_))
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, ChatError::Permission(_) | ChatError::NotSignedIn)
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
