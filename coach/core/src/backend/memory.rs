//! In-Memory Backend
//!
//! Offline stand-in for the coaching service. Sessions and messages live in
//! this instance only; replies are canned texts rendered as the same SSE
//! stream the real service sends, one word per event.
//!
//! Tests steer it with [`StreamScript`]s: each queued script shapes the next
//! opened stream (fail to open, drop mid-stream, stall, truncate, or send raw
//! wire bytes).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;

use super::traits::{ByteStream, CoachingBackend, NewSession, StreamRequest, StreamTransport};
use crate::conversation::{Message, MessageStatus};
use crate::diagnostics::Diagnostics;
use crate::error::TransportError;
use crate::messages::SessionId;
use crate::session::{Persona, Session};
use crate::streaming::{DONE_SENTINEL, META_PREFIX};

/// Canned coaching replies, used in rotation
pub const DEFAULT_REPLIES: &[&str] = &[
    "That's a really important observation. Let me ask you this: when you think about the \
     situation you just described, what's the one thing you're most avoiding? Sometimes the \
     thing we dance around is exactly where the growth opportunity lives.",
    "I hear you, and what you're navigating isn't easy. Let's break this down. What would \
     success look like for you here? Not what others expect, but what would genuinely feel \
     like a win for you?",
    "You mentioned this has been a pattern. Here's what I notice: you tend to take on \
     managing everyone's emotions in the room. What would happen if you let that go and \
     focused purely on the strategic outcome?",
    "Let's get specific. Think about the last meeting where you didn't show up the way you \
     wanted to. What was the gap between how you showed up and how you wanted to?",
    "That takes real self-awareness to recognize. Seeing the pattern already puts you ahead. \
     What's one small action you could take this week to start shifting it?",
    "It sounds like there's a tension between what you think you should do and what your \
     instinct is telling you. That instinct usually points at something important. What is \
     your gut telling you here?",
];

/// Opening line for each persona
#[must_use]
pub fn greeting_for(persona: Persona) -> &'static str {
    match persona {
        Persona::DirectChallenger => {
            "Good to see you. Let's not waste time. What's the most pressing challenge on your \
             plate right now? Give me the real version, not the polished one."
        }
        Persona::SupportiveStrategist => {
            "Welcome back. Before we dive in, how are you really doing today? I want to make \
             sure we focus on what matters most to you right now."
        }
    }
}

/// Coaching style each persona reports in its metadata
#[must_use]
pub fn style_for(persona: Persona) -> &'static str {
    match persona {
        Persona::DirectChallenger => "challenging",
        Persona::SupportiveStrategist => "supportive",
    }
}

/// Shape of the next opened stream
#[derive(Clone, Debug)]
pub enum StreamScript {
    /// `open_stream` fails
    FailOpen,
    /// The connection drops after this many content events
    FailAfter(usize),
    /// The stream stops delivering after this many content events and never ends
    StallAfter(usize),
    /// The connection closes mid-event after this many content events
    TruncateAfter(usize),
    /// Send these chunks verbatim
    Raw(Vec<String>),
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<SessionId, Session>,
    messages: HashMap<SessionId, Vec<Message>>,
    scripts: VecDeque<StreamScript>,
}

impl MemoryState {
    fn record(&mut self, message: Message) {
        let session_id = message.session_id.clone();
        let log = self.messages.entry(session_id.clone()).or_default();
        log.push(message);
        let count = log.len();
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.message_count = count;
        }
    }
}

/// In-memory coaching backend
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    reply_index: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
    replies: Arc<Vec<String>>,
    token_delay: Duration,
    emit_meta: bool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Backend with the default replies, no delay, metadata enabled
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            reply_index: Arc::new(AtomicUsize::new(0)),
            offline: Arc::new(AtomicBool::new(false)),
            replies: Arc::new(DEFAULT_REPLIES.iter().map(|r| (*r).to_string()).collect()),
            token_delay: Duration::ZERO,
            emit_meta: true,
        }
    }

    /// Replace the canned replies
    #[must_use]
    pub fn with_replies<I, S>(mut self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies: Vec<String> = replies.into_iter().map(Into::into).collect();
        if !replies.is_empty() {
            self.replies = Arc::new(replies);
        }
        self
    }

    /// Pause between stream events
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Whether replies start with a metadata event
    #[must_use]
    pub fn with_meta(mut self, enabled: bool) -> Self {
        self.emit_meta = enabled;
        self
    }

    /// Queue a script for the next opened stream
    pub fn push_script(&self, script: StreamScript) {
        self.state.lock().scripts.push_back(script);
    }

    /// Make every request/response call fail with a connection error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of replies handed out so far
    #[must_use]
    pub fn replies_served(&self) -> usize {
        self.reply_index.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(TransportError::ConnectionFailed(
                "in-memory backend is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn next_reply(&self) -> String {
        let index = self.reply_index.fetch_add(1, Ordering::SeqCst);
        self.replies[index % self.replies.len()].clone()
    }
}

/// `data: <payload>\n\n`
fn sse_event(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

fn token_event(text: &str) -> String {
    sse_event(&serde_json::json!({ "token": text }).to_string())
}

/// Split a reply into word tokens, keeping the separating spaces
fn word_tokens(text: &str) -> Vec<String> {
    text.split(' ')
        .enumerate()
        .map(|(i, word)| if i == 0 { word.to_string() } else { format!(" {word}") })
        .collect()
}

#[async_trait]
impl CoachingBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn start_session(&self, request: &NewSession) -> Result<Session, TransportError> {
        self.ensure_online()?;
        let session = Session::new(
            request.participant_id.clone(),
            request.persona,
            request.session_type,
            request.input_mode,
        );
        let mut state = self.state.lock();
        state.sessions.insert(session.id.clone(), session.clone());
        state.messages.insert(session.id.clone(), Vec::new());
        Ok(session)
    }

    async fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<Message, TransportError> {
        self.ensure_online()?;
        let reply = Message::assistant(session_id.clone(), self.next_reply());
        let mut user = Message::user(session_id.clone(), content);
        user.status = MessageStatus::Sent;

        let mut state = self.state.lock();
        if !state.sessions.contains_key(session_id) {
            return Err(TransportError::Http {
                status: 404,
                body: format!("session {session_id} not found"),
            });
        }
        state.record(user);
        state.record(reply.clone());
        Ok(reply)
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<Session, TransportError> {
        self.ensure_online()?;
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TransportError::Http {
                status: 404,
                body: format!("session {session_id} not found"),
            })?;
        let summary = format!(
            "Session completed with {} messages exchanged.",
            session.message_count
        );
        session.finish(Utc::now(), Some(summary));
        Ok(session.clone())
    }

    async fn get_messages(&self, session_id: &SessionId) -> Result<Vec<Message>, TransportError> {
        self.ensure_online()?;
        Ok(self
            .state
            .lock()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_session_history(
        &self,
        participant_id: &str,
    ) -> Result<Vec<Session>, TransportError> {
        self.ensure_online()?;
        let mut sessions: Vec<Session> = self
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| s.participant_id == participant_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }
}

#[async_trait]
impl StreamTransport for InMemoryBackend {
    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        let script = self.state.lock().scripts.pop_front();

        if matches!(script, Some(StreamScript::FailOpen)) {
            return Err(TransportError::ConnectionFailed(
                "scripted open failure".to_string(),
            ));
        }

        let greeting = request.is_greeting();
        let text = if greeting {
            greeting_for(request.persona).to_string()
        } else {
            self.next_reply()
        };

        if !greeting {
            let mut user = Message::user(request.session_id.clone(), request.message.clone());
            user.status = MessageStatus::Sent;
            self.state.lock().record(user);
        }

        let mut events: Vec<Result<Vec<u8>, TransportError>> = Vec::new();
        if self.emit_meta && !greeting {
            let meta = Diagnostics::heuristic(&request.message, style_for(request.persona));
            let json = serde_json::to_string(&meta)?;
            events.push(Ok(sse_event(&format!("{META_PREFIX}{json}")).into_bytes()));
        }

        let tokens = word_tokens(&text);
        let (cut, tail): (usize, Option<ScriptTail>) = match script {
            Some(StreamScript::FailAfter(n)) => (n, Some(ScriptTail::Fail)),
            Some(StreamScript::StallAfter(n)) => (n, Some(ScriptTail::Stall)),
            Some(StreamScript::TruncateAfter(n)) => (n, Some(ScriptTail::Truncate)),
            Some(StreamScript::Raw(chunks)) => {
                let raw = chunks.into_iter().map(|c| Ok(c.into_bytes())).collect();
                return Ok(self.pace(raw, None));
            }
            _ => (tokens.len(), None),
        };

        events.extend(
            tokens
                .iter()
                .take(cut)
                .map(|t| Ok(token_event(t).into_bytes())),
        );

        let completion = match tail {
            None => Some(Message::assistant(request.session_id.clone(), text)),
            Some(ScriptTail::Fail) => {
                events.push(Err(TransportError::ConnectionLost(
                    "scripted connection drop".to_string(),
                )));
                None
            }
            Some(ScriptTail::Truncate) => {
                events.push(Ok(b"data: {\"tok".to_vec()));
                None
            }
            Some(ScriptTail::Stall) => {
                let stream = self.pace(events, None);
                return Ok(stream.chain(futures::stream::pending()).boxed());
            }
        };

        Ok(self.pace(events, completion))
    }
}

enum ScriptTail {
    Fail,
    Stall,
    Truncate,
}

impl InMemoryBackend {
    /// Turn prepared events into a paced byte stream
    ///
    /// With a `completion`, the reply is recorded once every event has been
    /// delivered and the stream then ends with `[DONE]`. Readers stop at
    /// `[DONE]`, so the record has to come before it.
    fn pace(
        &self,
        events: Vec<Result<Vec<u8>, TransportError>>,
        completion: Option<Message>,
    ) -> ByteStream {
        let delay = self.token_delay;
        let events = futures::stream::iter(events).then(move |event| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            event
        });

        let Some(message) = completion else {
            return events.boxed();
        };
        let state = Arc::clone(&self.state);
        let finish = futures::stream::once(async move {
            state.lock().record(message);
            Ok(sse_event(DONE_SENTINEL).into_bytes())
        });

        events.chain(finish).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InputMode, SessionType};
    use crate::streaming::{Token, TokenStream};

    fn new_session(persona: Persona) -> NewSession {
        NewSession {
            participant_id: "p-1".to_string(),
            persona,
            session_type: SessionType::CheckIn,
            input_mode: InputMode::Text,
        }
    }

    async fn content_of(stream: ByteStream) -> (String, usize) {
        let tokens: Vec<_> = TokenStream::new(stream, "s").collect().await;
        let mut text = String::new();
        let mut metas = 0;
        for token in tokens {
            match token.unwrap() {
                Token::Content(t) => text.push_str(&t),
                Token::Meta(_) => metas += 1,
            }
        }
        (text, metas)
    }

    #[tokio::test]
    async fn test_greeting_stream() {
        let backend = InMemoryBackend::new();
        let session = backend
            .start_session(&new_session(Persona::DirectChallenger))
            .await
            .unwrap();
        let stream = backend
            .open_stream(&StreamRequest::greeting(session.id.clone(), session.persona))
            .await
            .unwrap();

        let (text, metas) = content_of(stream).await;
        assert_eq!(text, greeting_for(Persona::DirectChallenger));
        assert_eq!(metas, 0);
        assert_eq!(backend.replies_served(), 0);
        assert_eq!(backend.get_messages(&session.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replies_rotate_per_instance() {
        let backend = InMemoryBackend::new().with_replies(["first", "second"]);
        let other = InMemoryBackend::new().with_replies(["first", "second"]);
        let session = backend
            .start_session(&new_session(Persona::SupportiveStrategist))
            .await
            .unwrap();
        let request = StreamRequest {
            session_id: session.id.clone(),
            message: "I'm excited about the promotion".to_string(),
            persona: session.persona,
        };

        let (a, metas) = content_of(backend.open_stream(&request).await.unwrap()).await;
        let (b, _) = content_of(backend.open_stream(&request).await.unwrap()).await;
        let (c, _) = content_of(other.open_stream(&request).await.unwrap()).await;

        assert_eq!((a.as_str(), b.as_str(), c.as_str()), ("first", "second", "first"));
        assert_eq!(metas, 1);
        assert_eq!(backend.get_messages(&session.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let backend = InMemoryBackend::new().with_meta(false);
        let request = StreamRequest {
            session_id: SessionId::from("s"),
            message: "hello".to_string(),
            persona: Persona::default(),
        };

        backend.push_script(StreamScript::FailOpen);
        assert!(backend.open_stream(&request).await.is_err());

        backend.push_script(StreamScript::FailAfter(2));
        let items: Vec<_> = TokenStream::new(backend.open_stream(&request).await.unwrap(), "s")
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
    }

    #[tokio::test]
    async fn test_end_session_and_history() {
        let backend = InMemoryBackend::new();
        let first = backend
            .start_session(&new_session(Persona::DirectChallenger))
            .await
            .unwrap();
        let reply = backend.send_message(&first.id, "hi").await.unwrap();
        assert_eq!(reply.content, DEFAULT_REPLIES[0]);

        let ended = backend.end_session(&first.id).await.unwrap();
        assert!(!ended.is_active());
        assert_eq!(ended.message_count, 2);
        assert!(ended.summary.unwrap().contains("2 messages"));

        let history = backend.get_session_history("p-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(backend.get_session_history("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_mode() {
        let backend = InMemoryBackend::new();
        backend.set_offline(true);
        let err = backend
            .start_session(&new_session(Persona::DirectChallenger))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
