//! Crate-wide error type.
//!
//! Every failure a room session can meet maps onto one of these variants.
//! None of them is fatal to a session: callers convert them to local state
//! (a status flag, a chat line, an output panel) at the point they surface.

use thiserror::Error;

/// Errors produced by the room client, the lobby, the execution gateway and
/// the coordination service.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The event channel is unavailable or dropped. Recovered automatically
    /// by the reconnection policy.
    #[error("connection to {endpoint} failed: {detail}")]
    Connection { endpoint: String, detail: String },

    /// Room creation or room join was rejected. The message is shown to the
    /// user verbatim.
    #[error("{0}")]
    Join(String),

    /// The execution request failed before a program result was available.
    #[error("execution failed: {0}")]
    Execution(String),

    /// No local username has been chosen yet.
    #[error("no identity: choose a username before entering a room")]
    IdentityMissing,

    /// The session has not entered a room, or has already left it.
    #[error("not in a room")]
    NotInRoom,

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RoomError {
    /// Shorthand for a [`RoomError::Connection`].
    pub fn connection(endpoint: impl Into<String>, detail: impl ToString) -> Self {
        RoomError::Connection {
            endpoint: endpoint.into(),
            detail: detail.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RoomError>;
