//! Session Controller
//!
//! The controller owns one coaching session at a time: it opens and closes
//! it with the backend, keeps the conversation log, runs reply turns and
//! raises safety signals. Surfaces talk to it through `&mut self` methods and
//! listen on the [`CoachEvent`] channel handed over at construction.
//!
//! # Turn Lifecycle
//!
//! ```text
//!  send_message ──► user: sending ──► assistant placeholder (streaming)
//!                                          │
//!              ┌───────────────────────────┼────────────────────────┐
//!              ▼                           ▼                        ▼
//!          Finished               Failed/Truncated          cancel_streaming
//!     assistant finalized          placeholder removed      placeholder removed if
//!     user: sent                   user: failed (retry)     empty, else finalized
//!                                                           user: sent
//! ```
//!
//! A spawned consume task decodes the reply stream and forwards updates on a
//! channel. Nothing changes until [`SessionController::poll_streaming`] or
//! [`SessionController::settle`] applies them, so all mutation happens on the
//! caller's task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{CoachingBackend, NewSession, StreamRequest, StreamTransport};
use crate::config::SessionSettings;
use crate::conversation::{CancelOutcome, ConversationState, Message, MessageStatus};
use crate::diagnostics::{quick_replies_for, Diagnostics, QuickReply, DEFAULT_EMOTION};
use crate::error::{CoachError, Rejected, StateError, StreamError, TransportError};
use crate::messages::{CoachEvent, MessageId, MessageRole, NotifyLevel, SessionId};
use crate::persistence::SessionStore;
use crate::safety::{
    crisis_resources, CrisisTrigger, HandoffOutcome, SafetySignalDetector, HANDOFF_WINDOW,
};
use crate::session::{InputMode, Persona, Session, SessionType};
use crate::streaming::{run_turn, Token, TurnUpdate};
use crate::voice::{SpeechCapture, SpeechPlayback};

/// Elapsed-time counter resolution
const CLOCK_TICK: Duration = Duration::from_secs(1);

/// Controller configuration
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Style reported when a reply carries no metadata
    pub default_style: String,
    /// Messages inspected on a handoff request
    pub handoff_window: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_style: "supportive".to_string(),
            handoff_window: HANDOFF_WINDOW,
        }
    }
}

impl From<&SessionSettings> for ControllerConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            default_style: settings.default_style.clone(),
            handoff_window: settings.handoff_window,
        }
    }
}

/// Result of [`SessionController::request_handoff`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandoffRequest {
    /// A reply is streaming; evaluation runs once the turn ends
    Deferred,
    /// Evaluated now
    Evaluated(HandoffOutcome),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TurnKind {
    Greeting,
    Reply,
}

/// The reply turn in flight; dropping it stops the consume task
struct ActiveTurn {
    kind: TurnKind,
    user_message_id: Option<MessageId>,
    assistant_id: MessageId,
    updates: mpsc::UnboundedReceiver<TurnUpdate>,
    cancel: CancellationToken,
}

impl Drop for ActiveTurn {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Session timer, ticking once per second while the session is active
#[derive(Default)]
struct ElapsedClock {
    seconds: Arc<AtomicU64>,
    ticker: Option<CancellationToken>,
}

impl ElapsedClock {
    fn start(&mut self, from: u64) {
        self.stop();
        self.seconds.store(from, Ordering::SeqCst);

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let seconds = Arc::clone(&self.seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + CLOCK_TICK, CLOCK_TICK);
            loop {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        seconds.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
        self.ticker = Some(token);
    }

    fn freeze(&mut self, value: u64) {
        self.stop();
        self.seconds.store(value, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
    }

    fn seconds(&self) -> u64 {
        self.seconds.load(Ordering::SeqCst)
    }
}

impl Drop for ElapsedClock {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fire-and-forget saves, applied in submission order
///
/// Every save carries a sequence number; a save that acquires the write lock
/// after a newer one has been written is skipped.
#[derive(Default)]
struct SaveQueue {
    submitted: u64,
    written: Arc<tokio::sync::Mutex<u64>>,
    pending: Vec<JoinHandle<()>>,
}

impl SaveQueue {
    fn submit(&mut self, store: Arc<dyn SessionStore>, session: Session, messages: Vec<Message>) {
        self.pending.retain(|handle| !handle.is_finished());
        self.submitted += 1;
        let seq = self.submitted;
        let written = Arc::clone(&self.written);

        self.pending.push(tokio::spawn(async move {
            let mut last = written.lock().await;
            if *last > seq {
                tracing::trace!(session_id = %session.id, seq, "Skipping superseded save");
                return;
            }
            match store.save(&session, &messages).await {
                Ok(()) => *last = seq,
                Err(e) => tracing::warn!(
                    session_id = %session.id,
                    store = store.name(),
                    error = %e,
                    "Failed to persist session"
                ),
            }
        }));
    }

    async fn flush(&mut self) {
        for handle in self.pending.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Drives one coaching session
pub struct SessionController {
    backend: Arc<dyn CoachingBackend>,
    transport: Arc<dyn StreamTransport>,
    store: Arc<dyn SessionStore>,
    capture: Option<Arc<dyn SpeechCapture>>,
    playback: Option<Arc<dyn SpeechPlayback>>,
    detector: SafetySignalDetector,
    config: ControllerConfig,

    session: Option<Session>,
    conversation: ConversationState,
    turn: Option<ActiveTurn>,

    /// Handoff requested while a reply was streaming
    pending_handoff: bool,
    quick_replies: Vec<QuickReply>,
    crisis_active: bool,
    listening: bool,

    clock: ElapsedClock,
    saves: SaveQueue,
    speech: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<CoachEvent>,
}

impl SessionController {
    /// Create a controller
    ///
    /// `events` receives every [`CoachEvent`]; a dropped receiver is fine.
    pub fn new(
        backend: Arc<dyn CoachingBackend>,
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn SessionStore>,
        events: mpsc::UnboundedSender<CoachEvent>,
    ) -> Self {
        Self {
            backend,
            transport,
            store,
            capture: None,
            playback: None,
            detector: SafetySignalDetector::new(),
            config: ControllerConfig::default(),
            session: None,
            conversation: ConversationState::new(),
            turn: None,
            pending_handoff: false,
            quick_replies: Vec::new(),
            crisis_active: false,
            listening: false,
            clock: ElapsedClock::default(),
            saves: SaveQueue::default(),
            speech: Vec::new(),
            events,
        }
    }

    /// Apply configuration
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.detector = self.detector.with_window(config.handoff_window);
        self.config = config;
        self
    }

    /// Replace the safety detector
    #[must_use]
    pub fn with_detector(mut self, detector: SafetySignalDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Attach speech capture
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn SpeechCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Attach speech playback
    #[must_use]
    pub fn with_playback(mut self, playback: Arc<dyn SpeechPlayback>) -> Self {
        self.playback = Some(playback);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The current session, active or ended
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The conversation log
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    /// The conversation state
    #[must_use]
    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    /// Whether a reply turn is in flight
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.turn.is_some()
    }

    /// Seconds shown on the session timer
    #[must_use]
    pub fn elapsed_seconds(&self) -> u64 {
        self.clock.seconds()
    }

    /// Whether crisis resources are being shown
    #[must_use]
    pub fn crisis_active(&self) -> bool {
        self.crisis_active
    }

    /// The user closed the crisis resources
    pub fn dismiss_crisis(&mut self) {
        self.crisis_active = false;
    }

    /// Current quick replies
    #[must_use]
    pub fn quick_replies(&self) -> &[QuickReply] {
        &self.quick_replies
    }

    /// Whether a handoff evaluation waits for the current turn
    #[must_use]
    pub fn handoff_pending(&self) -> bool {
        self.pending_handoff
    }

    /// Whether speech capture is running
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Open a new session and stream the persona's greeting
    ///
    /// A session already held by this controller is dropped locally without
    /// being ended.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot open the session.
    pub async fn start_session(
        &mut self,
        participant_id: &str,
        persona: Persona,
        session_type: SessionType,
        input_mode: InputMode,
    ) -> Result<Session, CoachError> {
        let request = NewSession {
            participant_id: participant_id.to_string(),
            persona,
            session_type,
            input_mode,
        };
        let session = self.backend.start_session(&request).await?;

        self.reset();
        tracing::info!(
            session_id = %session.id,
            backend = self.backend.name(),
            persona = %persona,
            session_type = %session_type,
            "Session started"
        );

        self.clock.start(0);
        self.session = Some(session.clone());
        self.emit(CoachEvent::SessionStarted {
            session: session.clone(),
        });

        self.begin_turn(
            TurnKind::Greeting,
            None,
            StreamRequest::greeting(session.id.clone(), persona),
            None,
        )?;
        Ok(session)
    }

    /// Load an earlier session and its log
    ///
    /// Messages come from the session store, or from the backend when the
    /// store has no record. An active session's timer continues from
    /// `now - started_at`; an ended one shows its stored duration.
    ///
    /// # Errors
    ///
    /// Fails if neither the store nor the backend can provide the messages.
    pub async fn resume_session(&mut self, existing: Session) -> Result<Session, CoachError> {
        let messages = match self.store.load(&existing.id).await {
            Ok(Some((_, messages))) => messages,
            Ok(None) => self.backend.get_messages(&existing.id).await?,
            Err(e) => {
                tracing::warn!(
                    session_id = %existing.id,
                    error = %e,
                    "Session store unreadable, loading messages from backend"
                );
                self.backend.get_messages(&existing.id).await?
            }
        };

        self.reset();
        self.conversation = ConversationState::from_messages(messages);
        if existing.is_active() {
            self.clock.start(existing.seconds_since_start(Utc::now()));
        } else {
            self.clock.freeze(existing.duration_seconds.unwrap_or(0));
        }

        let message_count = self.conversation.len();
        tracing::info!(
            session_id = %existing.id,
            message_count,
            active = existing.is_active(),
            "Session resumed"
        );
        self.session = Some(existing.clone());
        self.emit(CoachEvent::SessionResumed {
            session: existing.clone(),
            message_count,
        });
        Ok(existing)
    }

    /// Resume a session saved in the session store
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if the store has no such session.
    pub async fn resume_stored(&mut self, id: &SessionId) -> Result<Session, CoachError> {
        let Some((session, _)) = self.store.load(id).await? else {
            return Err(CoachError::SessionNotFound(id.clone()));
        };
        self.resume_session(session).await
    }

    /// Finalize the session
    ///
    /// Stops the timer, cancels a streaming reply and asks the backend to
    /// end the session. If the backend is unreachable the session is ended
    /// locally and a warning notice is emitted. Ending an ended session
    /// returns it unchanged.
    ///
    /// # Errors
    ///
    /// `NoActiveSession` if no session was ever started.
    pub async fn end_session(&mut self) -> Result<Session, CoachError> {
        self.poll_streaming();
        let session_id = match &self.session {
            Some(session) if !session.is_active() => return Ok(session.clone()),
            Some(session) => session.id.clone(),
            None => return Err(Rejected::NoActiveSession.into()),
        };

        self.clock.stop();
        let elapsed = self.clock.seconds();
        if !self.cancel_streaming().await {
            self.stop_playback().await;
        }
        self.pending_handoff = false;

        let remote = match self.backend.end_session(&session_id).await {
            Ok(remote) => Some(remote),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Backend could not end session");
                self.notify(
                    NotifyLevel::Warning,
                    "Couldn't reach the coaching service; the session was ended on this device.",
                );
                None
            }
        };

        let Some(session) = self.session.as_mut() else {
            return Err(Rejected::NoActiveSession.into());
        };
        session.message_count = self.conversation.len();
        session.duration_seconds = remote
            .as_ref()
            .and_then(|r| r.duration_seconds)
            .or(Some(elapsed));
        if let Some(r) = remote.as_ref().filter(|r| !r.goal_ids.is_empty()) {
            session.goal_ids.clone_from(&r.goal_ids);
        }
        let ended_at = remote
            .as_ref()
            .and_then(|r| r.ended_at)
            .unwrap_or_else(Utc::now);
        session.finish(ended_at, remote.and_then(|r| r.summary));
        let ended = session.clone();

        self.clock.freeze(ended.duration_seconds.unwrap_or(elapsed));
        self.set_quick_replies(Vec::new());
        tracing::info!(
            session_id = %ended.id,
            duration_seconds = ended.duration_seconds.unwrap_or(0),
            message_count = ended.message_count,
            "Session ended"
        );
        self.emit(CoachEvent::SessionEnded {
            session: ended.clone(),
        });
        self.persist();
        Ok(ended)
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Send a user message and start its reply
    ///
    /// Crisis language raises the crisis signal before the reply stream is
    /// even opened.
    ///
    /// # Errors
    ///
    /// Rejected (nothing changes) for blank text, without an active session,
    /// or while a reply is streaming.
    pub fn send_message(&mut self, text: &str) -> Result<MessageId, Rejected> {
        self.poll_streaming();
        let content = text.trim();
        if content.is_empty() {
            return Err(Rejected::BlankInput);
        }
        let (session_id, persona) = self.active_session()?;
        if self.turn.is_some() {
            return Err(Rejected::StreamInProgress);
        }

        self.set_quick_replies(Vec::new());
        let user_id = self
            .conversation
            .push_user(session_id.clone(), content)
            .map_err(|_| Rejected::StreamInProgress)?;
        self.emit_appended(&user_id);

        if self.detector.is_crisis(content) {
            self.raise_crisis(CrisisTrigger::UserMessage);
        }

        let request = StreamRequest {
            session_id,
            message: content.to_string(),
            persona,
        };
        let seed = Diagnostics::heuristic(content, &self.config.default_style);
        self.begin_turn(TurnKind::Reply, Some(user_id.clone()), request, Some(seed))
            .map_err(|_| Rejected::StreamInProgress)?;
        Ok(user_id)
    }

    /// Re-issue the turn of a failed user message
    ///
    /// # Errors
    ///
    /// Rejected unless `id` names a `failed` user message and no reply is
    /// streaming.
    pub fn retry_message(&mut self, id: &MessageId) -> Result<(), Rejected> {
        self.poll_streaming();
        let (session_id, persona) = self.active_session()?;
        if self.turn.is_some() {
            return Err(Rejected::StreamInProgress);
        }
        let message = self
            .conversation
            .get(id)
            .ok_or_else(|| Rejected::UnknownMessage(id.clone()))?;
        if message.role != MessageRole::User || message.status != MessageStatus::Failed {
            return Err(Rejected::NotRetryable(id.clone()));
        }
        let content = message.content.clone();

        self.conversation
            .set_status(id, MessageStatus::Sending)
            .map_err(|_| Rejected::NotRetryable(id.clone()))?;
        self.emit(CoachEvent::MessageStatusChanged {
            message_id: id.clone(),
            status: MessageStatus::Sending,
        });
        tracing::debug!(message_id = %id, "Retrying message");

        let seed = Diagnostics::heuristic(&content, &self.config.default_style);
        let request = StreamRequest {
            session_id,
            message: content,
            persona,
        };
        self.begin_turn(TurnKind::Reply, Some(id.clone()), request, Some(seed))
            .map_err(|_| Rejected::StreamInProgress)?;
        Ok(())
    }

    /// Stop the streaming reply
    ///
    /// An empty placeholder is removed, a partial reply is kept. Returns
    /// `false` when nothing was streaming.
    pub async fn cancel_streaming(&mut self) -> bool {
        let Some(turn) = self.turn.take() else {
            return false;
        };
        turn.cancel.cancel();

        let outcome = self.conversation.cancel_streaming();
        if let Some(user_id) = &turn.user_message_id {
            self.mark_user(user_id, MessageStatus::Sent);
        }
        let kept = matches!(outcome, Some(CancelOutcome::Kept(_)));
        tracing::info!(message_id = %turn.assistant_id, kept, "Reply stream cancelled");
        self.emit(CoachEvent::StreamCancelled {
            message_id: turn.assistant_id.clone(),
            kept,
        });
        drop(turn);

        self.stop_playback().await;
        self.persist();
        self.run_deferred_handoff();
        true
    }

    /// Send the text of a quick reply
    ///
    /// # Errors
    ///
    /// `UnknownQuickReply` if `id` is not in the current set, otherwise as
    /// [`send_message`](Self::send_message).
    pub fn choose_quick_reply(&mut self, id: &str) -> Result<MessageId, Rejected> {
        let text = self
            .quick_replies
            .iter()
            .find(|reply| reply.id == id)
            .map(|reply| reply.text.clone())
            .ok_or_else(|| Rejected::UnknownQuickReply(id.to_string()))?;
        self.send_message(&text)
    }

    // ========================================================================
    // Safety
    // ========================================================================

    /// The user asked for a human coach
    ///
    /// # Errors
    ///
    /// `NoActiveSession` without an active session.
    pub fn request_handoff(&mut self) -> Result<HandoffRequest, Rejected> {
        self.poll_streaming();
        self.active_session()?;
        if self.turn.is_some() {
            self.pending_handoff = true;
            tracing::debug!("Handoff deferred until the reply finishes");
            return Ok(HandoffRequest::Deferred);
        }
        Ok(HandoffRequest::Evaluated(self.evaluate_handoff()))
    }

    fn evaluate_handoff(&mut self) -> HandoffOutcome {
        let outcome = self.detector.evaluate_handoff(self.conversation.messages());
        match &outcome {
            HandoffOutcome::Crisis => self.raise_crisis(CrisisTrigger::Handoff),
            HandoffOutcome::Options => {
                tracing::info!("Offering handoff options");
                self.emit(CoachEvent::HandoffOptions);
            }
        }
        outcome
    }

    fn run_deferred_handoff(&mut self) {
        if std::mem::take(&mut self.pending_handoff) {
            self.evaluate_handoff();
        }
    }

    fn raise_crisis(&mut self, trigger: CrisisTrigger) {
        self.crisis_active = true;
        tracing::warn!(trigger = ?trigger, "Crisis signal raised");
        self.emit(CoachEvent::CrisisDetected {
            trigger,
            resources: crisis_resources(),
        });
    }

    // ========================================================================
    // Voice
    // ========================================================================

    /// Start speech capture
    ///
    /// # Errors
    ///
    /// Fails without an active session, without a capture collaborator, or
    /// if capture cannot start.
    pub async fn start_voice_input(&mut self) -> Result<(), CoachError> {
        self.active_session()?;
        let capture = self
            .capture
            .clone()
            .ok_or_else(|| CoachError::Voice("no speech capture available".to_string()))?;
        self.stop_playback().await;
        capture
            .start_capture()
            .await
            .map_err(|e| CoachError::Voice(e.to_string()))?;
        self.listening = true;
        tracing::debug!("Listening");
        Ok(())
    }

    /// Stop speech capture and send the transcript
    ///
    /// Returns `None` when nothing was heard.
    ///
    /// # Errors
    ///
    /// Fails if capture fails, or the message is rejected.
    pub async fn end_voice_input(&mut self) -> Result<Option<MessageId>, CoachError> {
        let capture = self
            .capture
            .clone()
            .ok_or_else(|| CoachError::Voice("no speech capture available".to_string()))?;
        self.listening = false;
        let transcript = capture
            .stop_capture()
            .await
            .map_err(|e| CoachError::Voice(e.to_string()))?;
        if transcript.trim().is_empty() {
            self.notify(NotifyLevel::Info, "No speech detected.");
            return Ok(None);
        }
        Ok(Some(self.send_message(&transcript)?))
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    /// Apply every reply update already received, without waiting
    ///
    /// Returns true if anything was applied.
    pub fn poll_streaming(&mut self) -> bool {
        let mut applied = false;
        while let Some(update) = self.next_ready_update() {
            self.apply_update(update);
            applied = true;
        }
        applied
    }

    /// Wait until the current reply turn ends
    pub async fn settle(&mut self) {
        loop {
            let update = match self.turn.as_mut() {
                Some(turn) => turn.updates.recv().await.unwrap_or_else(lost_consumer),
                None => return,
            };
            self.apply_update(update);
        }
    }

    /// Wait for pending saves and playback hand-offs
    pub async fn flush(&mut self) {
        self.saves.flush().await;
        for handle in self.speech.drain(..) {
            let _ = handle.await;
        }
    }

    fn next_ready_update(&mut self) -> Option<TurnUpdate> {
        let turn = self.turn.as_mut()?;
        match turn.updates.try_recv() {
            Ok(update) => Some(update),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(lost_consumer()),
        }
    }

    fn begin_turn(
        &mut self,
        kind: TurnKind,
        user_message_id: Option<MessageId>,
        request: StreamRequest,
        diagnostics: Option<Diagnostics>,
    ) -> Result<MessageId, StateError> {
        let assistant_id = self
            .conversation
            .begin_assistant(request.session_id.clone(), diagnostics)?;
        self.emit_appended(&assistant_id);

        tracing::debug!(
            session_id = %request.session_id,
            message_id = %assistant_id,
            greeting = kind == TurnKind::Greeting,
            "Opening reply stream"
        );
        let (tx, updates) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_turn(
            Arc::clone(&self.transport),
            request,
            self.config.default_style.clone(),
            cancel.clone(),
            tx,
        ));

        self.turn = Some(ActiveTurn {
            kind,
            user_message_id,
            assistant_id: assistant_id.clone(),
            updates,
            cancel,
        });
        Ok(assistant_id)
    }

    fn apply_update(&mut self, update: TurnUpdate) {
        let Some(assistant_id) = self.turn.as_ref().map(|t| t.assistant_id.clone()) else {
            return;
        };
        match update {
            TurnUpdate::Token(Token::Content(text)) => {
                if self.conversation.append_content(&assistant_id, &text).is_ok() {
                    self.emit(CoachEvent::Token {
                        message_id: assistant_id,
                        text,
                    });
                }
            }
            TurnUpdate::Token(Token::Meta(diagnostics)) => {
                let high_risk = diagnostics.is_high_risk();
                if self
                    .conversation
                    .replace_diagnostics(&assistant_id, diagnostics.clone())
                    .is_ok()
                {
                    self.emit(CoachEvent::DiagnosticsUpdated {
                        message_id: assistant_id,
                        diagnostics,
                    });
                }
                if high_risk && !self.crisis_active {
                    self.raise_crisis(CrisisTrigger::StreamMetadata);
                }
            }
            TurnUpdate::Finished => self.complete_turn(),
            TurnUpdate::Truncated { pending_bytes } => {
                tracing::warn!(message_id = %assistant_id, pending_bytes, "Reply stream truncated");
                self.emit(CoachEvent::StreamTruncated {
                    message_id: assistant_id,
                    pending_bytes,
                });
                self.fail_turn(&StreamError::Truncated { pending_bytes });
            }
            TurnUpdate::Failed(error) => self.fail_turn(&error),
        }
    }

    /// Finalize the reply, even when no text arrived
    fn complete_turn(&mut self) {
        let Some(turn) = self.turn.take() else {
            return;
        };
        let id = turn.assistant_id.clone();
        let finished = self.conversation.finish_streaming(&id).ok().cloned();
        if let Some(user_id) = &turn.user_message_id {
            self.mark_user(user_id, MessageStatus::Sent);
        }

        let content = finished
            .as_ref()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        tracing::debug!(message_id = %id, chars = content.len(), "Reply stream finished");
        self.emit(CoachEvent::StreamFinished {
            message_id: id,
            content,
        });

        if let Some(message) = finished {
            let emotion = message
                .diagnostics
                .as_ref()
                .map_or(DEFAULT_EMOTION, |d| d.emotion_detected.as_str());
            self.set_quick_replies(quick_replies_for(emotion));
            if !message.content.is_empty() {
                self.speak(&message.content);
            }
        }
        self.persist();
        self.run_deferred_handoff();
    }

    fn fail_turn(&mut self, error: &StreamError) {
        let Some(turn) = self.turn.take() else {
            return;
        };
        let _ = self.conversation.discard_streaming(&turn.assistant_id);
        if let Some(user_id) = &turn.user_message_id {
            self.mark_user(user_id, MessageStatus::Failed);
        }

        let retryable = turn.kind == TurnKind::Reply;
        tracing::warn!(
            message_id = %turn.assistant_id,
            error = %error,
            retryable,
            "Reply stream failed"
        );
        self.emit(CoachEvent::StreamFailed {
            message_id: turn.assistant_id.clone(),
            user_message_id: turn.user_message_id.clone(),
            error: error.to_string(),
            retryable,
        });
        self.persist();
        self.run_deferred_handoff();
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn active_session(&self) -> Result<(SessionId, Persona), Rejected> {
        match &self.session {
            Some(session) if session.is_active() => Ok((session.id.clone(), session.persona)),
            _ => Err(Rejected::NoActiveSession),
        }
    }

    fn reset(&mut self) {
        self.turn = None;
        self.conversation = ConversationState::new();
        self.pending_handoff = false;
        self.quick_replies.clear();
        self.crisis_active = false;
        self.listening = false;
        self.clock.stop();
    }

    fn mark_user(&mut self, id: &MessageId, status: MessageStatus) {
        match self.conversation.set_status(id, status) {
            Ok(()) => self.emit(CoachEvent::MessageStatusChanged {
                message_id: id.clone(),
                status,
            }),
            Err(e) => tracing::debug!(message_id = %id, error = %e, "Status unchanged"),
        }
    }

    fn set_quick_replies(&mut self, replies: Vec<QuickReply>) {
        if replies.is_empty() && self.quick_replies.is_empty() {
            return;
        }
        self.quick_replies.clone_from(&replies);
        self.emit(CoachEvent::QuickReplies { replies });
    }

    fn voice_mode(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.input_mode == InputMode::Voice)
    }

    fn speak(&mut self, text: &str) {
        if !self.voice_mode() {
            return;
        }
        let Some(playback) = self.playback.clone() else {
            return;
        };
        let text = text.to_string();
        self.speech.retain(|handle| !handle.is_finished());
        self.speech.push(tokio::spawn(async move {
            if let Err(e) = playback.speak(&text).await {
                tracing::warn!(error = %e, "Playback failed");
            }
        }));
    }

    async fn stop_playback(&self) {
        if !self.voice_mode() {
            return;
        }
        if let Some(playback) = &self.playback {
            playback.stop().await;
        }
    }

    fn persist(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.message_count = self.conversation.len();
        self.saves.submit(
            Arc::clone(&self.store),
            session.clone(),
            self.conversation.messages().to_vec(),
        );
    }

    fn emit_appended(&self, id: &MessageId) {
        if let Some(message) = self.conversation.get(id) {
            self.emit(CoachEvent::MessageAppended {
                message: message.clone(),
            });
        }
    }

    fn notify(&self, level: NotifyLevel, message: &str) {
        self.emit(CoachEvent::Notify {
            level,
            message: message.to_string(),
        });
    }

    fn emit(&self, event: CoachEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}

fn lost_consumer() -> TurnUpdate {
    TurnUpdate::Failed(StreamError::Transport(TransportError::ConnectionClosed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, StreamScript};
    use crate::persistence::MemoryStore;

    fn controller() -> (
        SessionController,
        InMemoryBackend,
        mpsc::UnboundedReceiver<CoachEvent>,
    ) {
        let backend = InMemoryBackend::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(backend.clone());
        let controller =
            SessionController::new(shared.clone(), shared, Arc::new(MemoryStore::new()), tx);
        (controller, backend, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CoachEvent>) -> Vec<CoachEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_rejects_without_session() {
        let (mut controller, _backend, _rx) = controller();
        assert_eq!(
            controller.send_message("hello"),
            Err(Rejected::NoActiveSession)
        );
        assert_eq!(controller.request_handoff(), Err(Rejected::NoActiveSession));
        assert!(matches!(
            controller.end_session().await,
            Err(CoachError::Rejected(Rejected::NoActiveSession))
        ));
        assert!(!controller.cancel_streaming().await);
    }

    #[tokio::test]
    async fn test_blank_input_changes_nothing() {
        let (mut controller, _backend, mut rx) = controller();
        controller
            .start_session("p", Persona::default(), SessionType::CheckIn, InputMode::Text)
            .await
            .unwrap();
        controller.settle().await;
        let before = controller.messages().to_vec();
        drain(&mut rx);

        assert_eq!(controller.send_message("   \n"), Err(Rejected::BlankInput));
        assert_eq!(controller.messages(), before.as_slice());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_meta_replaces_seeded_diagnostics() {
        let (mut controller, backend, _rx) = controller();
        controller
            .start_session("p", Persona::DirectChallenger, SessionType::CheckIn, InputMode::Text)
            .await
            .unwrap();
        controller.settle().await;

        backend.push_script(StreamScript::Raw(vec![
            "data: __META__:{\"style_used\":\"challenging\",\"emotion_detected\":\"motivated\"}\n\n"
                .to_string(),
            "data: {\"token\":\"Go.\"}\n\ndata: [DONE]\n\n".to_string(),
        ]));
        controller.send_message("I feel stuck").unwrap();
        controller.settle().await;

        let reply = controller.messages().last().unwrap();
        let diagnostics = reply.diagnostics.as_ref().unwrap();
        assert_eq!(reply.content, "Go.");
        assert_eq!(diagnostics.style_used, "challenging");
        assert_eq!(diagnostics.emotion_detected, "motivated");
        assert_eq!(controller.quick_replies().len(), 3);
    }

    #[tokio::test]
    async fn test_high_risk_meta_raises_crisis() {
        let (mut controller, backend, mut rx) = controller();
        controller
            .start_session("p", Persona::default(), SessionType::CheckIn, InputMode::Text)
            .await
            .unwrap();
        controller.settle().await;
        drain(&mut rx);

        backend.push_script(StreamScript::Raw(vec![
            "data: __META__:{\"risk_level\":\"high\"}\n\ndata: {\"token\":\"I hear you.\"}\n\ndata: [DONE]\n\n"
                .to_string(),
        ]));
        controller.send_message("Rough week").unwrap();
        controller.settle().await;

        assert!(controller.crisis_active());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            CoachEvent::CrisisDetected {
                trigger: CrisisTrigger::StreamMetadata,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_empty_reply_is_finalized() {
        let (mut controller, backend, mut rx) = controller();
        controller
            .start_session("p", Persona::default(), SessionType::CheckIn, InputMode::Text)
            .await
            .unwrap();
        controller.settle().await;
        drain(&mut rx);

        backend.push_script(StreamScript::Raw(vec!["data: [DONE]\n\n".to_string()]));
        let user_id = controller.send_message("Anything?").unwrap();
        controller.settle().await;

        let messages = controller.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].id, user_id);
        assert_eq!(messages[1].status, MessageStatus::Sent);
        let reply = &messages[2];
        assert_eq!(reply.role, MessageRole::Assistant);
        assert!(reply.content.is_empty());
        assert!(!reply.is_streaming);

        let reply_id = reply.id.clone();
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            CoachEvent::StreamFinished { message_id, content } if *message_id == reply_id && content.is_empty()
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_queue_last_write_wins() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = SaveQueue::default();
        let mut session = Session::new("p", Persona::default(), SessionType::CheckIn, InputMode::Text);

        for summary in ["first", "second", "third"] {
            session.summary = Some(summary.to_string());
            queue.submit(store.clone(), session.clone(), Vec::new());
        }
        queue.flush().await;

        let (saved, _) = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(saved.summary.as_deref(), Some("third"));
    }
}
