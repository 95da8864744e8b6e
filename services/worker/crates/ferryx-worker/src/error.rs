//! Typed error enums.
//!
//! Every component returns one of these; `main` converts them to
//! `anyhow::Error` via the `?` operator.

use std::path::PathBuf;

use thiserror::Error;

// ── Config errors ─────────────────────────────────────────────────────────────

/// Fatal startup errors: the worker must not start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required.")]
    Missing(&'static str),

    #[error("FERRYX_HUB_URL is not a valid URL: {url}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("FERRYX_HUB_URL must use http or https, got '{0}'")]
    UnsupportedScheme(String),

    #[error("FERRYX_LISTEN_ADDR is not a socket address: {0}")]
    InvalidListenAddr(String),

    #[error(transparent)]
    Token(#[from] TokenError),
}

// ── Token errors ──────────────────────────────────────────────────────────────

/// Errors deriving a signed token from a raw shared key.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("hub key is not valid base64")]
    InvalidKey(#[from] base64::DecodeError),

    #[error("failed to sign hub token")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

// ── Channel errors ────────────────────────────────────────────────────────────

/// Errors raised by the coordinator channel. All of them are transient from
/// the session's point of view.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("negotiate request failed")]
    Negotiate(#[from] reqwest::Error),

    #[error("negotiate rejected by hub: {0}")]
    NegotiateRejected(String),

    #[error("invalid hub endpoint: {0}")]
    Endpoint(String),

    #[error("websocket error")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("malformed hub message")]
    Protocol(#[from] serde_json::Error),

    #[error("channel is not connected")]
    NotConnected,

    #[error("channel is already started")]
    AlreadyStarted,

    #[error("connection lost before '{0}' completed")]
    ConnectionLost(String),

    #[error("hub invocation '{method}' failed: {message}")]
    Invocation { method: String, message: String },

    #[error("cancelled")]
    Cancelled,
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

// ── Runner errors ─────────────────────────────────────────────────────────────

/// Errors from the subprocess runner. A non-zero exit code is not an error.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled while waiting for {0}")]
    Cancelled(String),
}

// ── Deploy errors ─────────────────────────────────────────────────────────────

/// Errors handling a single deploy event. Logged and dropped by the dispatcher.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{action} {}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("temp script task failed")]
    Join(#[from] tokio::task::JoinError),
}

impl DeployError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}
