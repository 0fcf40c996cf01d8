//! Voice Collaborators
//!
//! Speech capture and playback are platform services the engine only drives.
//! The controller calls them; how audio is recorded or synthesized is up to
//! the implementation.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Records speech and returns a transcript
#[async_trait]
pub trait SpeechCapture: Send + Sync {
    /// Start listening
    async fn start_capture(&self) -> anyhow::Result<()>;

    /// Stop listening and return what was heard
    async fn stop_capture(&self) -> anyhow::Result<String>;
}

/// Speaks assistant replies
#[async_trait]
pub trait SpeechPlayback: Send + Sync {
    /// Speak `text`, replacing anything currently playing
    async fn speak(&self, text: &str) -> anyhow::Result<()>;

    /// Stop speaking
    async fn stop(&self);
}

/// Capture that replays queued transcripts
#[derive(Debug, Default)]
pub struct ScriptedCapture {
    transcripts: Mutex<VecDeque<String>>,
    listening: Mutex<bool>,
}

impl ScriptedCapture {
    /// Capture that will return `transcripts` in order
    pub fn new<I, S>(transcripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transcripts: Mutex::new(transcripts.into_iter().map(Into::into).collect()),
            listening: Mutex::new(false),
        }
    }

    /// Whether `start_capture` was called without a matching stop
    #[must_use]
    pub fn is_listening(&self) -> bool {
        *self.listening.lock()
    }
}

#[async_trait]
impl SpeechCapture for ScriptedCapture {
    async fn start_capture(&self) -> anyhow::Result<()> {
        let mut listening = self.listening.lock();
        if *listening {
            anyhow::bail!("capture already running");
        }
        *listening = true;
        Ok(())
    }

    async fn stop_capture(&self) -> anyhow::Result<String> {
        let mut listening = self.listening.lock();
        if !*listening {
            anyhow::bail!("capture not running");
        }
        *listening = false;
        Ok(self.transcripts.lock().pop_front().unwrap_or_default())
    }
}

/// Playback that records what it was asked to say
#[derive(Debug, Default)]
pub struct RecordingPlayback {
    spoken: Mutex<Vec<String>>,
    stops: Mutex<usize>,
}

impl RecordingPlayback {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything passed to `speak`
    #[must_use]
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().clone()
    }

    /// How many times playback was stopped
    #[must_use]
    pub fn stops(&self) -> usize {
        *self.stops.lock()
    }
}

#[async_trait]
impl SpeechPlayback for RecordingPlayback {
    async fn speak(&self, text: &str) -> anyhow::Result<()> {
        self.spoken.lock().push(text.to_string());
        Ok(())
    }

    async fn stop(&self) {
        *self.stops.lock() += 1;
    }
}
