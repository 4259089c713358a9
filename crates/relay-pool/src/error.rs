//! Error types

use crate::message::MessageError;
use thiserror::Error;

/// Errors returned to callers of the pool and broker.
///
/// Socket failures are not in here: a dropped or refused connection shows up
/// as a liveness change and as streams ending with [`crate::StreamEnd::Transport`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// A frame could not be encoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] MessageError),

    #[error("Not connected to relay")]
    NotConnected,

    /// The relay's keep-alive budget is exhausted; an existing keep-alive
    /// subscription must be closed first.
    #[error("Keep-alive pool full on {relay}")]
    KeepAlivePoolFull { relay: String },

    #[error("Invalid relay selection: {0}")]
    InvalidSelection(String),

    /// Relay is not part of the pool
    #[error("Unknown relay: {0}")]
    UnknownRelay(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The broker task is gone
    #[error("Broker closed")]
    BrokerClosed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
