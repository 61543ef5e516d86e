//! Crate-wide error taxonomy (§7 of the design: transport, protocol, auth, decoder, persistence).

use thiserror::Error;

/// Errors surfaced across the playback core's foreground operations.
///
/// Background subsystems (the scrobble driver, preload preparations) never propagate these;
/// they log and retry instead, per the error propagation policy.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("transport error calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("protocol error from {endpoint}: {message}")]
    Protocol { endpoint: String, message: String },

    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("decoder error: {message}")]
    Decoder { message: String },

    #[error("persistence error: {message}")]
    Persistence { message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("result set is empty")]
    EmptyResult,
}

impl PlaybackError {
    pub fn transport(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn protocol(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Protocol {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn persistence(message: impl std::fmt::Display) -> Self {
        Self::Persistence {
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlaybackError>;
