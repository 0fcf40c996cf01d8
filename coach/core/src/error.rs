//! Error Types
//!
//! One enum per layer. Only [`TransportError`] is ever retried automatically
//! (by the connection manager); everything else is surfaced to the caller or
//! logged.

use thiserror::Error;

use crate::conversation::MessageStatus;
use crate::messages::{MessageId, SessionId};

/// Errors from the network layer (stream transport, backend API, socket)
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to the peer could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection dropped while data was in flight
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The server answered with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code returned by the server
        status: u16,
        /// Response body (may be empty)
        body: String,
    },

    /// An operation that needs an open connection was attempted without one
    #[error("Not connected")]
    NotConnected,

    /// Request or response body could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Heartbeat ping failed
    #[error("Ping failed: {0}")]
    PingFailed(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::Http {
                status: status.as_u16(),
                body: String::new(),
            };
        }
        if err.is_connect() {
            Self::ConnectionFailed(err.to_string())
        } else if err.is_decode() {
            Self::Serialization(err.to_string())
        } else {
            Self::ConnectionLost(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Terminal failures of a decoded token stream
#[derive(Debug, Error)]
pub enum StreamError {
    /// The underlying transport failed mid-stream
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The transport closed without `[DONE]` while a partial event was buffered
    #[error("Stream truncated with {pending_bytes} bytes of an unfinished event")]
    Truncated {
        /// Size of the discarded partial event
        pending_bytes: usize,
    },

    /// An event grew past the decoder's buffer limit without a delimiter
    #[error("Event exceeds {limit} bytes without a delimiter")]
    EventTooLarge {
        /// The configured limit
        limit: usize,
    },
}

/// Why a controller operation was refused without touching any state
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Rejected {
    /// Message text was empty or whitespace
    #[error("message is blank")]
    BlankInput,
    /// No session has been started or resumed, or it has ended
    #[error("no active session")]
    NoActiveSession,
    /// A reply is already streaming
    #[error("a response is already streaming")]
    StreamInProgress,
    /// The message does not exist
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
    /// The message exists but cannot be retried
    #[error("message {0} is not a failed user message")]
    NotRetryable(MessageId),
    /// The quick reply is no longer offered
    #[error("unknown quick reply {0}")]
    UnknownQuickReply(String),
}

/// Illegal conversation log transition
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StateError {
    /// No message with this ID
    #[error("message {0} not found")]
    NotFound(MessageId),
    /// Status changes only apply to user messages
    #[error("message {0} is not a user message")]
    NotUserMessage(MessageId),
    /// The requested status change is not one of the legal transitions
    #[error("illegal status transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current status
        from: MessageStatus,
        /// Requested status
        to: MessageStatus,
    },
    /// A streaming message is already open
    #[error("message {0} is still streaming")]
    AlreadyStreaming(MessageId),
    /// The message is not the open streaming message
    #[error("message {0} is not streaming")]
    NotStreaming(MessageId),
}

/// Failures of the persistence collaborator
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem failure
    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored document could not be (de)serialized
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Backend-specific failure
    #[error("storage error: {0}")]
    Other(String),
}

/// Top-level error for controller operations that genuinely fail
#[derive(Debug, Error)]
pub enum CoachError {
    /// The operation was refused locally
    #[error(transparent)]
    Rejected(#[from] Rejected),
    /// Backend call failed
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Conversation log rejected a transition
    #[error(transparent)]
    State(#[from] StateError),
    /// Session store failed
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    /// No stored session with this ID
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    /// Speech capture or playback collaborator failed
    #[error("voice error: {0}")]
    Voice(String),
}
