use thiserror::Error;

use crate::GuildId;

/// Errors surfaced by the audio client.
#[derive(Debug, Error)]
pub enum AudioError {
    /// A guild or channel identifier did not resolve to a valid snowflake.
    #[error("invalid guild or channel id: {0}")]
    InvalidArgument(String),

    /// An operation needed a node and none is connected.
    #[error("no audio node connected")]
    NodeUnavailable,

    /// An operation needed a live voice session and the guild has none.
    #[error("no voice session for guild {0}")]
    SessionNotFound(GuildId),

    /// A bounded wait for a node event ran out.
    #[error("timed out waiting for `{0}`")]
    Timeout(String),

    /// The node transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A request against a node's REST surface failed.
    #[error("node request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A node returned a body this client could not make sense of.
    #[error("unexpected node response: {0}")]
    UnexpectedResponse(String),

    /// Reading the configuration file failed.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Decoding JSON (config, status, wire frame) failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors from a node's wire transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The connection is gone; the frame was not delivered.
    #[error("transport closed")]
    Closed,

    /// The peer sent something that is not a frame.
    #[error("malformed frame: {0}")]
    Malformed(String),
}
