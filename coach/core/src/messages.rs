//! Controller Events
//!
//! Everything the [`SessionController`](crate::controller::SessionController)
//! tells a surface goes through [`CoachEvent`]. Surfaces hold no conversation
//! logic of their own: they render the events and read the controller's
//! accessors when they need a full snapshot.
//!
//! Identifiers for sessions and messages also live here since both the events
//! and the stored documents carry them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::{Message, MessageStatus};
use crate::diagnostics::{Diagnostics, QuickReply};
use crate::safety::{CrisisResource, CrisisTrigger};
use crate::session::Session;

/// Events from the controller to a surface
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoachEvent {
    // ============================================
    // Session Lifecycle
    // ============================================
    /// A new session was opened with the backend
    SessionStarted {
        /// The session as returned by the backend
        session: Session,
    },

    /// An earlier session was loaded back into the controller
    SessionResumed {
        /// The resumed session
        session: Session,
        /// Number of messages restored into the log
        message_count: usize,
    },

    /// The session was finalized
    SessionEnded {
        /// The ended session (`ended_at` is set)
        session: Session,
    },

    // ============================================
    // Conversation Log
    // ============================================
    /// A message was appended to the log
    MessageAppended {
        /// Snapshot of the new message
        message: Message,
    },

    /// A user message changed delivery status
    MessageStatusChanged {
        /// The user message
        message_id: MessageId,
        /// Its new status
        status: MessageStatus,
    },

    // ============================================
    // Streaming
    // ============================================
    /// A content token was appended to the streaming message
    Token {
        /// The streaming assistant message
        message_id: MessageId,
        /// Text appended
        text: String,
    },

    /// Diagnostics of the streaming message were replaced by a metadata event
    DiagnosticsUpdated {
        /// The streaming assistant message
        message_id: MessageId,
        /// The new diagnostics
        diagnostics: Diagnostics,
    },

    /// The stream completed and the message was finalized
    StreamFinished {
        /// The finalized assistant message
        message_id: MessageId,
        /// Final content
        content: String,
    },

    /// The transport closed mid-event; followed by [`CoachEvent::StreamFailed`]
    StreamTruncated {
        /// The discarded assistant message
        message_id: MessageId,
        /// Size of the discarded partial event
        pending_bytes: usize,
    },

    /// The user cancelled the stream
    StreamCancelled {
        /// The assistant message that was streaming
        message_id: MessageId,
        /// Whether the partial message was kept (false when it was still empty)
        kept: bool,
    },

    /// The stream failed; the placeholder was removed
    StreamFailed {
        /// The removed assistant placeholder
        message_id: MessageId,
        /// The user message that is now `failed`, if this was a reply turn
        user_message_id: Option<MessageId>,
        /// Error description
        error: String,
        /// Whether `retry_message` can re-issue the turn
        retryable: bool,
    },

    // ============================================
    // Safety
    // ============================================
    /// Crisis language was detected; resources must be shown immediately
    CrisisDetected {
        /// What triggered the detection
        trigger: CrisisTrigger,
        /// Resources to surface
        resources: Vec<CrisisResource>,
    },

    /// Handoff was requested and no crisis was found
    HandoffOptions,

    // ============================================
    // Suggestions & Notices
    // ============================================
    /// Replacement set of quick replies (empty clears them)
    QuickReplies {
        /// The suggestions
        replies: Vec<QuickReply>,
    },

    /// Out-of-band notice for the user
    Notify {
        /// Severity
        level: NotifyLevel,
        /// Text to show
        message: String,
    },
}

/// Unique message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session identifier
///
/// Assigned by the backend; the in-memory backend uses v4 UUIDs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The participant
    User,
    /// The coach
    Assistant,
    /// System notice
    System,
}

/// Notice severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyLevel {
    /// Informational
    Info,
    /// Something degraded but the session continues
    Warning,
    /// An operation failed
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_unique() {
        let id1 = MessageId::new();
        let id2 = MessageId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_session_id_is_transparent_in_json() {
        let id = SessionId::from("abc-123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc-123\"");
        assert_eq!(id.to_string(), "abc-123");
    }

    #[test]
    fn test_role_wire_names() {
        let json = serde_json::to_string(&MessageRole::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let role: MessageRole = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, MessageRole::User);
    }
}
