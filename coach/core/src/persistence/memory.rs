//! In-memory session store

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{sort_newest_first, SessionStore, SessionSummary, StoredSession};
use crate::conversation::Message;
use crate::error::PersistenceError;
use crate::messages::SessionId;
use crate::session::Session;

/// Session store backed by a map owned by this instance
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, StoredSession>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, session: &Session, messages: &[Message]) -> Result<(), PersistenceError> {
        let document = StoredSession::new(session.clone(), messages.to_vec());
        self.sessions.write().insert(session.id.clone(), document);
        Ok(())
    }

    async fn load(
        &self,
        id: &SessionId,
    ) -> Result<Option<(Session, Vec<Message>)>, PersistenceError> {
        Ok(self
            .sessions
            .read()
            .get(id)
            .map(|doc| (doc.session.clone(), doc.messages.clone())))
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, PersistenceError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .values()
            .map(|doc| SessionSummary::of(&doc.session, &doc.messages))
            .collect();
        sort_newest_first(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, id: &SessionId) -> Result<(), PersistenceError> {
        self.sessions.write().remove(id);
        Ok(())
    }
}
