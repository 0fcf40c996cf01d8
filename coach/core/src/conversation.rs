//! Conversation State
//!
//! The ordered message log of one session and the only place message fields
//! change. Every mutation goes through a method that checks the transition
//! first and returns [`StateError`] without touching the log when it is not
//! legal.
//!
//! Rules enforced here:
//!
//! - at most one message is streaming, and it is always the last one
//! - user delivery status moves `sending -> sent`, `sending -> failed`, or
//!   `failed -> sending`
//! - an assistant message only ever goes from streaming to finalized
//! - diagnostics are replaced (never merged) and only while streaming

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostics;
use crate::error::StateError;
use crate::messages::{MessageId, MessageRole, SessionId};

/// Delivery status of a message
///
/// Only meaningful for user messages; assistant and system messages are
/// created `Sent`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for the reply stream to complete
    Sending,
    /// Delivered
    Sent,
    /// The reply stream failed; can be retried
    Failed,
}

impl MessageStatus {
    /// Whether a user message may move from `self` to `to`
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Sending, Self::Sent | Self::Failed) | (Self::Failed, Self::Sending)
        )
    }
}

/// One entry in the conversation log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique ID
    pub id: MessageId,
    /// Owning session
    pub session_id: SessionId,
    /// Who wrote it
    pub role: MessageRole,
    /// Text so far
    pub content: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Still receiving tokens
    #[serde(default)]
    pub is_streaming: bool,
    /// Delivery status
    pub status: MessageStatus,
    /// Analysis attached to this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
}

impl Message {
    fn new(session_id: SessionId, role: MessageRole, content: String, status: MessageStatus) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            role,
            content,
            timestamp: Utc::now(),
            is_streaming: false,
            status,
            diagnostics: None,
        }
    }

    /// A user message waiting for its reply
    pub fn user(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::User, content.into(), MessageStatus::Sending)
    }

    /// A finalized assistant message
    pub fn assistant(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::Assistant, content.into(), MessageStatus::Sent)
    }

    /// A system notice
    pub fn system(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::System, content.into(), MessageStatus::Sent)
    }

    /// An empty assistant placeholder that receives tokens
    pub fn streaming(session_id: SessionId, diagnostics: Option<Diagnostics>) -> Self {
        let mut message = Self::assistant(session_id, String::new());
        message.is_streaming = true;
        message.diagnostics = diagnostics;
        message
    }
}

/// What [`ConversationState::cancel_streaming`] did with the open message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The message had no content and was removed
    Removed(MessageId),
    /// The partial message was finalized and kept
    Kept(MessageId),
}

/// Ordered message log for one session
#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    messages: Vec<Message>,
    streaming_id: Option<MessageId>,
}

impl ConversationState {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from stored messages
    ///
    /// A stored log may have been saved mid-stream. Any message still flagged
    /// as streaming is finalized, or dropped when it has no content, so the
    /// restored log never holds an open stream. User messages left `sending`
    /// become `failed` so they can be retried.
    #[must_use]
    pub fn from_messages(messages: Vec<Message>) -> Self {
        let messages = messages
            .into_iter()
            .filter_map(|mut message| {
                if message.is_streaming {
                    if message.content.is_empty() {
                        return None;
                    }
                    message.is_streaming = false;
                }
                if message.role == MessageRole::User && message.status == MessageStatus::Sending {
                    message.status = MessageStatus::Failed;
                }
                Some(message)
            })
            .collect();
        Self {
            messages,
            streaming_id: None,
        }
    }

    /// All messages in order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Look up a message
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Most recent message
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// ID of the open streaming message
    #[must_use]
    pub fn streaming_id(&self) -> Option<&MessageId> {
        self.streaming_id.as_ref()
    }

    /// Whether a message is streaming
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming_id.is_some()
    }

    /// The last `n` messages, oldest first
    #[must_use]
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// Append a user message with status `sending`
    ///
    /// # Errors
    ///
    /// Fails if a message is streaming, since the streaming message must stay
    /// last.
    pub fn push_user(
        &mut self,
        session_id: SessionId,
        content: impl Into<String>,
    ) -> Result<MessageId, StateError> {
        self.push(Message::user(session_id, content))
    }

    /// Append a finalized system notice
    ///
    /// # Errors
    ///
    /// Fails if a message is streaming.
    pub fn push_system(
        &mut self,
        session_id: SessionId,
        content: impl Into<String>,
    ) -> Result<MessageId, StateError> {
        self.push(Message::system(session_id, content))
    }

    fn push(&mut self, message: Message) -> Result<MessageId, StateError> {
        if let Some(open) = &self.streaming_id {
            return Err(StateError::AlreadyStreaming(open.clone()));
        }
        let id = message.id.clone();
        self.messages.push(message);
        Ok(id)
    }

    /// Open an empty assistant message for streaming
    ///
    /// # Errors
    ///
    /// Fails if another message is already streaming.
    pub fn begin_assistant(
        &mut self,
        session_id: SessionId,
        diagnostics: Option<Diagnostics>,
    ) -> Result<MessageId, StateError> {
        let id = self.push(Message::streaming(session_id, diagnostics))?;
        self.streaming_id = Some(id.clone());
        Ok(id)
    }

    fn streaming_mut(&mut self, id: &MessageId) -> Result<&mut Message, StateError> {
        if self.streaming_id.as_ref() != Some(id) {
            return Err(StateError::NotStreaming(id.clone()));
        }
        // The streaming message is always last.
        match self.messages.last_mut() {
            Some(message) if &message.id == id => Ok(message),
            _ => Err(StateError::NotFound(id.clone())),
        }
    }

    /// Append text to the streaming message
    ///
    /// # Errors
    ///
    /// Fails if `id` is not the streaming message.
    pub fn append_content(&mut self, id: &MessageId, text: &str) -> Result<(), StateError> {
        self.streaming_mut(id)?.content.push_str(text);
        Ok(())
    }

    /// Replace the diagnostics of the streaming message
    ///
    /// # Errors
    ///
    /// Fails if `id` is not the streaming message.
    pub fn replace_diagnostics(
        &mut self,
        id: &MessageId,
        diagnostics: Diagnostics,
    ) -> Result<(), StateError> {
        self.streaming_mut(id)?.diagnostics = Some(diagnostics);
        Ok(())
    }

    /// Finalize the streaming message
    ///
    /// # Errors
    ///
    /// Fails if `id` is not the streaming message.
    pub fn finish_streaming(&mut self, id: &MessageId) -> Result<&Message, StateError> {
        self.streaming_mut(id)?.is_streaming = false;
        self.streaming_id = None;
        self.get(id).ok_or_else(|| StateError::NotFound(id.clone()))
    }

    /// Remove the streaming message entirely
    ///
    /// # Errors
    ///
    /// Fails if `id` is not the streaming message.
    pub fn discard_streaming(&mut self, id: &MessageId) -> Result<Message, StateError> {
        self.streaming_mut(id)?;
        self.streaming_id = None;
        self.messages
            .pop()
            .ok_or_else(|| StateError::NotFound(id.clone()))
    }

    /// Stop the open stream, if any
    ///
    /// An empty placeholder is removed so the log never holds an empty
    /// finalized message; a partial one is kept. Returns `None` when nothing
    /// was streaming.
    pub fn cancel_streaming(&mut self) -> Option<CancelOutcome> {
        let id = self.streaming_id.clone()?;
        let empty = self
            .messages
            .last()
            .is_some_and(|m| m.id == id && m.content.is_empty());
        if empty {
            self.discard_streaming(&id).ok()?;
            Some(CancelOutcome::Removed(id))
        } else {
            self.finish_streaming(&id).ok()?;
            Some(CancelOutcome::Kept(id))
        }
    }

    /// Change the delivery status of a user message
    ///
    /// # Errors
    ///
    /// Fails for unknown IDs, non-user messages, and any transition other
    /// than `sending -> sent`, `sending -> failed`, `failed -> sending`.
    pub fn set_status(&mut self, id: &MessageId, status: MessageStatus) -> Result<(), StateError> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| StateError::NotFound(id.clone()))?;
        if message.role != MessageRole::User {
            return Err(StateError::NotUserMessage(id.clone()));
        }
        if !message.status.can_transition_to(status) {
            return Err(StateError::IllegalTransition {
                from: message.status,
                to: status,
            });
        }
        message.status = status;
        Ok(())
    }

    /// Contents of the last `n` messages joined by newlines
    #[must_use]
    pub fn recent_text(&self, n: usize) -> String {
        self.recent(n)
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
