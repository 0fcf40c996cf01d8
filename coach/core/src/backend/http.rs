//! HTTP Backend Implementation
//!
//! Client for the coaching service.
//!
//! # API
//!
//! - `POST /sessions` - open a session
//! - `GET /sessions?user_id=eq.<id>&order=started_at.desc` - session history
//! - `POST /sessions/{id}/end` - finalize a session
//! - `POST /messages` - send a message, non-streamed reply
//! - `GET /messages?session_id=eq.<id>&order=timestamp.asc` - stored messages
//! - `POST /chat-stream` - streamed reply as server-sent events
//!
//! Bodies use camelCase keys; they are mapped onto the crate's own types
//! here so nothing else sees the wire shape.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::traits::{ByteStream, CoachingBackend, NewSession, StreamRequest, StreamTransport};
use crate::config::BackendSettings;
use crate::conversation::{Message, MessageStatus};
use crate::diagnostics::Diagnostics;
use crate::error::TransportError;
use crate::messages::{MessageId, MessageRole, SessionId};
use crate::session::{InputMode, Persona, Session, SessionType};

/// Default API base URL
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1";

/// Timeout for request/response calls (streams are not bounded)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for establishing a connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP coaching backend
#[derive(Clone)]
pub struct HttpBackend {
    /// Base URL without trailing slash
    base_url: String,
    /// Bearer token sent with every request
    auth_token: Option<String>,
    /// Timeout for non-streaming calls
    request_timeout: Duration,
    /// HTTP client
    http_client: reqwest::Client,
}

impl HttpBackend {
    /// Create a backend for `base_url`
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built (TLS backend unavailable).
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            base_url,
            auth_token: None,
            request_timeout: REQUEST_TIMEOUT,
            http_client,
        })
    }

    /// Create from backend settings
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn from_config(settings: &BackendSettings) -> Result<Self, TransportError> {
        let mut backend = Self::new(settings.api_url.clone())?;
        backend.auth_token.clone_from(&settings.auth_token);
        backend.request_timeout = Duration::from_secs(settings.request_timeout_secs);
        Ok(backend)
    }

    /// Create from environment variables
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn from_env() -> Result<Self, TransportError> {
        let base_url =
            std::env::var("COACH_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let mut backend = Self::new(base_url)?;
        backend.auth_token = std::env::var("COACH_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());
        Ok(backend)
    }

    /// Attach a bearer token
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Base URL in use
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let request = self
            .authorize(self.http_client.post(self.url(path)))
            .timeout(self.request_timeout)
            .json(body);
        let response = check_status(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
    {
        let request = self
            .authorize(self.http_client.get(self.url(path)))
            .timeout(self.request_timeout)
            .query(query);
        let response = check_status(request.send().await?).await?;
        Ok(response.json().await?)
    }
}

/// Turn a non-2xx response into `TransportError::Http` with its body
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CoachingBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    async fn start_session(&self, request: &NewSession) -> Result<Session, TransportError> {
        let body = StartSessionBody {
            user_id: &request.participant_id,
            persona: request.persona,
            session_type: request.session_type,
            input_mode: request.input_mode,
        };
        let session: RemoteSession = self.post_json("/sessions", &body).await?;
        tracing::debug!(session_id = %session.id, "Session opened");
        Ok(session.into())
    }

    async fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<Message, TransportError> {
        let body = SendMessageBody {
            session_id,
            content,
            role: MessageRole::User,
        };
        let message: RemoteMessage = self.post_json("/messages", &body).await?;
        Ok(message.into())
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<Session, TransportError> {
        let body = EndSessionBody { session_id };
        let session: RemoteSession = self
            .post_json(&format!("/sessions/{session_id}/end"), &body)
            .await?;
        Ok(session.into())
    }

    async fn get_messages(&self, session_id: &SessionId) -> Result<Vec<Message>, TransportError> {
        let query = [
            ("session_id", format!("eq.{session_id}")),
            ("order", "timestamp.asc".to_string()),
        ];
        let messages: Vec<RemoteMessage> = self.get_json("/messages", &query).await?;
        Ok(messages.into_iter().map(Into::into).collect())
    }

    async fn get_session_history(
        &self,
        participant_id: &str,
    ) -> Result<Vec<Session>, TransportError> {
        let query = [
            ("user_id", format!("eq.{participant_id}")),
            ("order", "started_at.desc".to_string()),
        ];
        let sessions: Vec<RemoteSession> = self.get_json("/sessions", &query).await?;
        Ok(sessions.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl StreamTransport for HttpBackend {
    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        let builder = self
            .authorize(self.http_client.post(self.url("/chat-stream")))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
        let response = check_status(builder.send().await?).await?;

        tracing::debug!(
            session_id = %request.session_id,
            greeting = request.is_greeting(),
            "Reply stream opened"
        );

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(TransportError::from))
            .boxed())
    }
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionBody<'a> {
    user_id: &'a str,
    persona: Persona,
    session_type: SessionType,
    input_mode: InputMode,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody<'a> {
    session_id: &'a SessionId,
    content: &'a str,
    role: MessageRole,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EndSessionBody<'a> {
    session_id: &'a SessionId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteSession {
    id: SessionId,
    user_id: String,
    persona: Persona,
    session_type: SessionType,
    input_mode: InputMode,
    started_at: DateTime<Utc>,
    #[serde(default)]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    duration_seconds: Option<u64>,
    #[serde(default)]
    message_count: usize,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    goal_ids: Vec<String>,
}

impl From<RemoteSession> for Session {
    fn from(remote: RemoteSession) -> Self {
        Self {
            id: remote.id,
            participant_id: remote.user_id,
            persona: remote.persona,
            session_type: remote.session_type,
            input_mode: remote.input_mode,
            started_at: remote.started_at,
            ended_at: remote.ended_at,
            duration_seconds: remote.duration_seconds,
            message_count: remote.message_count,
            summary: remote.summary,
            goal_ids: remote.goal_ids,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteMessage {
    id: MessageId,
    session_id: SessionId,
    role: MessageRole,
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    diagnostics: Option<Diagnostics>,
}

impl From<RemoteMessage> for Message {
    fn from(remote: RemoteMessage) -> Self {
        Self {
            id: remote.id,
            session_id: remote.session_id,
            role: remote.role,
            content: remote.content,
            timestamp: remote.timestamp,
            is_streaming: false,
            status: MessageStatus::Sent,
            diagnostics: remote.diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let backend = HttpBackend::new("http://example.test/api/v1/").unwrap();
        assert_eq!(backend.base_url(), "http://example.test/api/v1");
        assert_eq!(backend.url("/chat-stream"), "http://example.test/api/v1/chat-stream");
    }

    #[test]
    fn test_stream_request_wire_shape() {
        let request = StreamRequest {
            session_id: SessionId::from("s-9"),
            message: "Hello".to_string(),
            persona: Persona::DirectChallenger,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "sessionId": "s-9",
                "message": "Hello",
                "persona": "direct_challenger"
            })
        );
    }

    #[test]
    fn test_start_body_wire_shape() {
        let body = StartSessionBody {
            user_id: "p-1",
            persona: Persona::SupportiveStrategist,
            session_type: SessionType::CheckIn,
            input_mode: InputMode::Voice,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["userId"], "p-1");
        assert_eq!(json["sessionType"], "check_in");
        assert_eq!(json["inputMode"], "voice");
    }

    #[test]
    fn test_remote_session_mapping() {
        let json = r#"{
            "id": "s-1",
            "userId": "p-7",
            "persona": "direct_challenger",
            "sessionType": "deep_dive",
            "inputMode": "text",
            "startedAt": "2026-03-01T09:00:00Z",
            "endedAt": "2026-03-01T09:20:00Z",
            "durationSeconds": 1200,
            "messageCount": 14,
            "summary": "Prioritization",
            "goalIds": ["g-1"]
        }"#;
        let remote: RemoteSession = serde_json::from_str(json).unwrap();
        let session: Session = remote.into();

        assert_eq!(session.participant_id, "p-7");
        assert_eq!(session.session_type, SessionType::DeepDive);
        assert!(!session.is_active());
        assert_eq!(session.duration_seconds, Some(1200));
        assert_eq!(session.goal_ids, vec!["g-1".to_string()]);
    }

    #[test]
    fn test_remote_message_mapping() {
        let json = r#"{
            "id": "m-1",
            "sessionId": "s-1",
            "role": "assistant",
            "content": "Welcome back",
            "timestamp": "2026-03-01T09:00:05Z"
        }"#;
        let remote: RemoteMessage = serde_json::from_str(json).unwrap();
        let message: Message = remote.into();
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.status, MessageStatus::Sent);
        assert!(!message.is_streaming);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        // Port 9 (discard) on localhost is almost never listening.
        let backend = HttpBackend::new("http://127.0.0.1:9").unwrap();
        let request = StreamRequest::greeting(SessionId::from("s"), Persona::default());
        let result = backend.open_stream(&request).await;
        assert!(result.is_err());
    }
}
