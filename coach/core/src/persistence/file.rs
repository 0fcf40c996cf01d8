//! JSON file session store
//!
//! Layout: `<dir>/<session-id>.json`. Writes go to a uniquely named temp file
//! in the same directory and are renamed into place, so a reader never sees
//! a half-written document.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{sort_newest_first, SessionStore, SessionSummary, StoredSession};
use crate::conversation::Message;
use crate::error::PersistenceError;
use crate::messages::SessionId;
use crate::session::Session;

const EXTENSION: &str = "json";

/// Session store writing one JSON document per session
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `dir` (created on first save)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default data directory: `$XDG_DATA_HOME/coachline/sessions`
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|p| p.join("coachline").join("sessions"))
    }

    /// Directory in use
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &SessionId) -> Result<PathBuf, PersistenceError> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PersistenceError::Other(format!(
                "session id '{raw}' is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{raw}.{EXTENSION}")))
    }

    async fn read_document(path: &Path) -> Result<Option<StoredSession>, PersistenceError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    fn name(&self) -> &'static str {
        "json-file"
    }

    async fn save(&self, session: &Session, messages: &[Message]) -> Result<(), PersistenceError> {
        let path = self.path_for(&session.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let document = StoredSession::new(session.clone(), messages.to_vec());
        let bytes = serde_json::to_vec_pretty(&document)?;

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", session.id, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(
            session_id = %session.id,
            path = %path.display(),
            messages = messages.len(),
            "Session saved"
        );
        Ok(())
    }

    async fn load(
        &self,
        id: &SessionId,
    ) -> Result<Option<(Session, Vec<Message>)>, PersistenceError> {
        let path = self.path_for(id)?;
        Ok(Self::read_document(&path)
            .await?
            .map(|doc| (doc.session, doc.messages)))
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, PersistenceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_document = path.extension().is_some_and(|ext| ext == EXTENSION)
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_document {
                continue;
            }
            match Self::read_document(&path).await {
                Ok(Some(doc)) => summaries.push(SessionSummary::of(&doc.session, &doc.messages)),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                }
            }
        }

        sort_newest_first(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, id: &SessionId) -> Result<(), PersistenceError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_support::full_session;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("sessions"));
        let (session, messages) = full_session("s-1", 0);

        store.save(&session, &messages).await.unwrap();
        let (loaded_session, loaded_messages) = store.load(&session.id).await.unwrap().unwrap();

        assert_eq!(loaded_session, session);
        assert_eq!(loaded_messages, messages);
    }

    #[tokio::test]
    async fn test_missing_directory_and_session() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("never-created"));
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.load(&SessionId::from("nope")).await.unwrap().is_none());
        store.delete(&SessionId::from("nope")).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_skips_junk_and_sorts() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let (older, older_log) = full_session("older", 0);
        let (newer, newer_log) = full_session("newer", 90);
        store.save(&older, &older_log).await.unwrap();
        store.save(&newer, &newer_log).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let listed = store.list().await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let (mut session, messages) = full_session("s-1", 0);
        store.save(&session, &messages).await.unwrap();
        session.summary = Some("second".to_string());
        store.save(&session, &messages).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["s-1.json".to_string()]);
        let (loaded, _) = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.summary.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let (mut session, messages) = full_session("s-1", 0);
        session.id = SessionId::from("../escape");
        assert!(matches!(
            store.save(&session, &messages).await,
            Err(PersistenceError::Other(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let (session, messages) = full_session("s-1", 0);
        store.save(&session, &messages).await.unwrap();
        store.delete(&session.id).await.unwrap();
        assert!(store.load(&session.id).await.unwrap().is_none());
    }
}
