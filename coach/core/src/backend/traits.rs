//! Backend Trait Definitions
//!
//! Two seams: [`CoachingBackend`] for the request/response session API and
//! [`StreamTransport`] for the reply stream. Both implementations in this
//! crate provide both traits, but the controller takes them separately so a
//! test can swap only the stream.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::conversation::Message;
use crate::error::TransportError;
use crate::messages::SessionId;
use crate::session::{InputMode, Persona, SessionType, Session};

/// Raw reply bytes, chunked however the transport delivers them
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Parameters for opening a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    /// Who the session is for
    pub participant_id: String,
    /// Coach persona
    pub persona: Persona,
    /// Session kind
    pub session_type: SessionType,
    /// Text or voice
    pub input_mode: InputMode,
}

/// Request for one streamed reply
///
/// An empty `message` asks for the persona's greeting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    /// Session the reply belongs to
    pub session_id: SessionId,
    /// User text (empty for the greeting)
    pub message: String,
    /// Persona answering
    pub persona: Persona,
}

impl StreamRequest {
    /// Request the opening greeting
    #[must_use]
    pub fn greeting(session_id: SessionId, persona: Persona) -> Self {
        Self {
            session_id,
            message: String::new(),
            persona,
        }
    }

    /// Whether this asks for the greeting
    #[must_use]
    pub fn is_greeting(&self) -> bool {
        self.message.trim().is_empty()
    }
}

/// Session API of the coaching service
#[async_trait]
pub trait CoachingBackend: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &'static str;

    /// Open a new session
    async fn start_session(&self, request: &NewSession) -> Result<Session, TransportError>;

    /// Send a message and wait for the complete (non-streamed) reply
    async fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<Message, TransportError>;

    /// Finalize a session; the returned session has `ended_at` set
    async fn end_session(&self, session_id: &SessionId) -> Result<Session, TransportError>;

    /// Messages stored for a session
    async fn get_messages(&self, session_id: &SessionId) -> Result<Vec<Message>, TransportError>;

    /// Past sessions of a participant, newest first
    async fn get_session_history(&self, participant_id: &str)
        -> Result<Vec<Session>, TransportError>;
}

/// Opens reply streams
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open the byte stream for one reply
    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, TransportError>;
}
