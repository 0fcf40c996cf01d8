//! Session Persistence
//!
//! Local copies of sessions and their message logs, so a conversation can be
//! resumed without the backend and listed offline.
//!
//! # Stores
//!
//! - [`MemoryStore`]: per-instance map, for tests and `--offline` runs
//! - [`JsonFileStore`]: one JSON document per session under a data directory
//!
//! Saves are whole-document replacements; a later save of the same session
//! wins.

mod file;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::Message;
use crate::error::PersistenceError;
use crate::messages::SessionId;
use crate::session::{Persona, Session, SessionType};

pub use file::JsonFileStore;
pub use memory::MemoryStore;

/// Listing entry for a stored session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session ID
    pub id: SessionId,
    /// Coach persona
    pub persona: Persona,
    /// Session kind
    pub session_type: SessionType,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time, if ended
    pub ended_at: Option<DateTime<Utc>>,
    /// Messages in the stored log
    pub message_count: usize,
    /// Recap, if the backend wrote one
    pub summary: Option<String>,
}

impl SessionSummary {
    /// Summarize a stored session
    #[must_use]
    pub fn of(session: &Session, messages: &[Message]) -> Self {
        Self {
            id: session.id.clone(),
            persona: session.persona,
            session_type: session.session_type,
            started_at: session.started_at,
            ended_at: session.ended_at,
            message_count: messages.len(),
            summary: session.summary.clone(),
        }
    }

    /// Whether the session was still open when saved
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// The document written for one session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    /// Document format version
    #[serde(default = "StoredSession::current_version")]
    pub version: u32,
    /// The session
    pub session: Session,
    /// Its message log
    pub messages: Vec<Message>,
}

impl StoredSession {
    /// Current document format version
    pub const VERSION: u32 = 1;

    fn current_version() -> u32 {
        Self::VERSION
    }

    /// Wrap a session and its log
    #[must_use]
    pub fn new(session: Session, messages: Vec<Message>) -> Self {
        Self {
            version: Self::VERSION,
            session,
            messages,
        }
    }
}

/// Storage for sessions and their logs
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store name for logs
    fn name(&self) -> &'static str;

    /// Replace the stored copy of `session`
    async fn save(&self, session: &Session, messages: &[Message]) -> Result<(), PersistenceError>;

    /// Load a session and its log
    async fn load(&self, id: &SessionId)
        -> Result<Option<(Session, Vec<Message>)>, PersistenceError>;

    /// All stored sessions, newest first
    async fn list(&self) -> Result<Vec<SessionSummary>, PersistenceError>;

    /// Remove a session; removing an unknown session is not an error
    async fn delete(&self, id: &SessionId) -> Result<(), PersistenceError>;
}

/// Sort summaries newest first
pub(crate) fn sort_newest_first(summaries: &mut [SessionSummary]) {
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{Duration, TimeZone, Utc};

    use crate::conversation::{Message, MessageStatus};
    use crate::diagnostics::Diagnostics;
    use crate::messages::SessionId;
    use crate::session::{InputMode, Persona, Session, SessionType};

    /// A session with every optional field populated
    pub fn full_session(id: &str, start_offset_minutes: i64) -> (Session, Vec<Message>) {
        let started_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
            + Duration::minutes(start_offset_minutes);
        let session = Session {
            id: SessionId::from(id),
            participant_id: "p-1".to_string(),
            persona: Persona::DirectChallenger,
            session_type: SessionType::GoalReview,
            input_mode: InputMode::Voice,
            started_at,
            ended_at: Some(started_at + Duration::minutes(20)),
            duration_seconds: Some(1200),
            message_count: 3,
            summary: Some("Reviewed Q3 goals".to_string()),
            goal_ids: vec!["g-1".to_string(), "g-2".to_string()],
        };

        let mut greeting = Message::assistant(session.id.clone(), "Let's review.");
        greeting.timestamp = started_at;
        let mut user = Message::user(session.id.clone(), "I missed two deadlines");
        user.status = MessageStatus::Failed;
        user.timestamp = started_at + Duration::seconds(30);
        let mut reply = Message::assistant(session.id.clone(), "What got in the way?");
        reply.timestamp = started_at + Duration::seconds(35);
        let mut diagnostics = Diagnostics::heuristic("I missed two deadlines", "challenging");
        diagnostics.goal_anchor = Some("Ship on time".to_string());
        diagnostics.outcome_prediction = Some(serde_json::json!({"confidence": 0.4}));
        reply.diagnostics = Some(diagnostics);

        (session, vec![greeting, user, reply])
    }
}
